//! Property-based tests over graph validation and name resolution.

mod common;

use inferpipe::pipeline::{ModuleInterfaces, PipelineGraph};
use inferpipe::{
    EdgeConfig, Endpoint, InputBindingConfig, ModuleConfig, PipelineConfig, PipelineError,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn module_table(n: usize) -> Vec<ModuleConfig> {
    (0..n)
        .map(|i| ModuleConfig {
            artifact: format!("stage{i}.so"),
            weights: String::new(),
            device: String::new(),
        })
        .collect()
}

fn one_in_one_out(n: usize) -> Vec<ModuleInterfaces> {
    (0..n)
        .map(|_| ModuleInterfaces {
            inputs: vec!["input".to_string()],
            outputs: vec!["output".to_string()],
        })
        .collect()
}

/// A linear chain over an arbitrary ordering of the module indices.
fn chain_over(order: &[usize]) -> PipelineConfig {
    let mut inputs = BTreeMap::new();
    inputs.insert(
        "x".to_string(),
        InputBindingConfig {
            module: order[0],
            interface: "input".to_string(),
        },
    );
    let edges = order
        .windows(2)
        .map(|w| EdgeConfig {
            from: Endpoint {
                module: w[0],
                interface: "output".to_string(),
            },
            to: Endpoint {
                module: w[1],
                interface: "input".to_string(),
            },
        })
        .collect();
    PipelineConfig {
        modules: module_table(order.len()),
        inputs,
        param_groups: BTreeMap::new(),
        edges,
        queue_depth: 2,
    }
}

/// A pure ring of `n` modules, every input fed by the previous stage.
fn ring(n: usize) -> PipelineConfig {
    let edges = (0..n)
        .map(|i| EdgeConfig {
            from: Endpoint {
                module: i,
                interface: "output".to_string(),
            },
            to: Endpoint {
                module: (i + 1) % n,
                interface: "input".to_string(),
            },
        })
        .collect();
    PipelineConfig {
        modules: module_table(n),
        inputs: BTreeMap::new(),
        param_groups: BTreeMap::new(),
        edges,
        queue_depth: 2,
    }
}

proptest! {
    /// Any permutation chain is a valid pipeline: exactly one terminal
    /// output, a topological order that respects every edge, and total
    /// input resolution.
    #[test]
    fn prop_permutation_chain_is_valid(
        order in (1usize..8)
            .prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle()),
    ) {
        let config = chain_over(&order);
        let graph = PipelineGraph::build(&config, one_in_one_out(order.len())).unwrap();

        prop_assert_eq!(graph.num_outputs(), 1);
        prop_assert_eq!(graph.terminal_outputs()[0].0.index(), order[order.len() - 1]);

        let (module, interface) = graph.resolve_input("x").unwrap();
        prop_assert_eq!(module.index(), order[0]);
        prop_assert_eq!(interface, "input");

        let position = |m: usize| {
            graph.topo_order().iter().position(|id| id.index() == m).unwrap()
        };
        for w in order.windows(2) {
            prop_assert!(position(w[0]) < position(w[1]));
        }
    }

    /// resolve_input succeeds iff the name appears in the routing table.
    #[test]
    fn prop_resolve_input_is_total_over_bound_names(name in "[a-z]{1,8}") {
        let order: Vec<usize> = (0..3).collect();
        let config = chain_over(&order);
        let graph = PipelineGraph::build(&config, one_in_one_out(3)).unwrap();

        match graph.resolve_input(&name) {
            Ok(_) => prop_assert!(config.inputs.contains_key(&name)),
            Err(PipelineError::UnknownName(n)) => {
                prop_assert!(!config.inputs.contains_key(&name));
                prop_assert_eq!(n, name);
            }
            Err(other) => prop_assert!(false, "unexpected error {:?}", other),
        }
    }

    /// A directed ring fails with CycleError regardless of its length.
    #[test]
    fn prop_ring_of_any_length_is_a_cycle(n in 1usize..8) {
        let config = ring(n);
        let err = PipelineGraph::build(&config, one_in_one_out(n)).unwrap_err();
        prop_assert!(matches!(err, PipelineError::Cycle));
    }

    /// A second source for an already-covered input always fails with
    /// DuplicateBinding.
    #[test]
    fn prop_second_source_is_duplicate(target in 1usize..4) {
        let order: Vec<usize> = (0..4).collect();
        let mut config = chain_over(&order);
        config.edges.push(EdgeConfig {
            from: Endpoint { module: 0, interface: "output".to_string() },
            to: Endpoint { module: target, interface: "input".to_string() },
        });
        let err = PipelineGraph::build(&config, one_in_one_out(4)).unwrap_err();
        let is_duplicate = matches!(err, PipelineError::DuplicateBinding { .. });
        prop_assert!(is_duplicate);
    }
}

#[test]
fn test_num_outputs_counts_unconsumed_interfaces() {
    common::init_tracing();
    // Stage 0 has two outputs; only one is consumed downstream.
    let mut inputs = BTreeMap::new();
    inputs.insert(
        "x".to_string(),
        InputBindingConfig {
            module: 0,
            interface: "input".to_string(),
        },
    );
    let config = PipelineConfig {
        modules: module_table(2),
        inputs,
        param_groups: BTreeMap::new(),
        edges: vec![EdgeConfig {
            from: Endpoint {
                module: 0,
                interface: "main".to_string(),
            },
            to: Endpoint {
                module: 1,
                interface: "input".to_string(),
            },
        }],
        queue_depth: 2,
    };
    let interfaces = vec![
        ModuleInterfaces {
            inputs: vec!["input".to_string()],
            outputs: vec!["main".to_string(), "aux".to_string()],
        },
        ModuleInterfaces {
            inputs: vec!["input".to_string()],
            outputs: vec!["output".to_string()],
        },
    ];
    let graph = PipelineGraph::build(&config, interfaces).unwrap();
    // (0, "aux") and (1, "output") are terminal, in ascending order.
    assert_eq!(graph.num_outputs(), 2);
    assert_eq!(graph.terminal_outputs()[0], (inferpipe::ModuleId(0), 1));
    assert_eq!(graph.terminal_outputs()[1], (inferpipe::ModuleId(1), 0));
}
