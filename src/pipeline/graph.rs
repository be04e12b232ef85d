//! The validated stage graph.
//!
//! Built once from the loaded configuration plus the interfaces each
//! module declares; immutable afterwards. Construction proves the three
//! structural invariants the scheduler relies on:
//!
//! 1. every module input interface is fed by exactly one source (a
//!    global input binding or one upstream edge),
//! 2. the edge set is acyclic,
//! 3. terminal outputs have a stable deterministic numbering
//!    (ascending module index, then ascending output-interface index).

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::id::ModuleId;
use crate::types::DeviceDescriptor;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

/// Immutable description of one pipeline stage.
#[derive(Debug, Clone)]
pub struct ModuleSpec {
    pub id: ModuleId,
    pub artifact: String,
    pub weights: String,
    pub device: DeviceDescriptor,
}

/// Interface names a module declared at initialization.
#[derive(Debug, Clone, Default)]
pub struct ModuleInterfaces {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

/// One endpoint of a validated edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeEnd {
    pub module: ModuleId,
    pub interface: String,
}

/// A directed data dependency from one module's output interface to
/// another module's input interface.
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: EdgeEnd,
    pub to: EdgeEnd,
}

/// The validated aggregate of module specs, bindings and edges.
#[derive(Debug)]
pub struct PipelineGraph {
    specs: Vec<ModuleSpec>,
    interfaces: Vec<ModuleInterfaces>,
    input_bindings: BTreeMap<String, (ModuleId, String)>,
    param_groups: BTreeMap<String, ModuleId>,
    edges: Vec<Edge>,
    topo: Vec<ModuleId>,
    /// Terminal output slots: `(module, output-interface index)`.
    terminals: Vec<(ModuleId, usize)>,
    queue_depth: usize,
}

impl PipelineGraph {
    /// Build and validate the graph.
    ///
    /// `interfaces[i]` holds the interfaces declared by the module at
    /// table index `i`; its length must match the module table.
    pub fn build(config: &PipelineConfig, interfaces: Vec<ModuleInterfaces>) -> Result<Self> {
        if config.modules.is_empty() {
            return Err(PipelineError::ConfigParse(
                "the module table is empty".to_string(),
            ));
        }
        if interfaces.len() != config.modules.len() {
            return Err(PipelineError::ConfigParse(format!(
                "module table has {} entries but {} interface sets were provided",
                config.modules.len(),
                interfaces.len()
            )));
        }

        let n = config.modules.len();
        let check_index = |index: usize, what: &str| -> Result<()> {
            if index >= n {
                return Err(PipelineError::ConfigParse(format!(
                    "{what} references module {index}, but the table has {n} entries"
                )));
            }
            Ok(())
        };

        // A module with no declared inputs has nothing to trigger it per
        // sample and can never be scheduled.
        for (index, iface) in interfaces.iter().enumerate() {
            if iface.inputs.is_empty() {
                return Err(PipelineError::ConfigParse(format!(
                    "module {index} declares no input interfaces"
                )));
            }
        }

        let mut specs = Vec::with_capacity(n);
        for (index, module) in config.modules.iter().enumerate() {
            specs.push(ModuleSpec {
                id: ModuleId::from(index),
                artifact: module.artifact.clone(),
                weights: module.weights.clone(),
                device: DeviceDescriptor::parse(&module.device)?,
            });
        }

        // Referential checks and source coverage. Each covered input slot
        // records where its data comes from so a second source is a
        // duplicate-binding failure, not a silent overwrite.
        let mut covered: HashMap<(usize, String), ()> = HashMap::new();
        let mut cover = |module: ModuleId, interface: &str| -> Result<()> {
            if covered
                .insert((module.index(), interface.to_string()), ())
                .is_some()
            {
                return Err(PipelineError::DuplicateBinding {
                    module,
                    interface: interface.to_string(),
                });
            }
            Ok(())
        };

        let mut input_bindings = BTreeMap::new();
        for (name, binding) in &config.inputs {
            check_index(binding.module, &format!("input binding {name:?}"))?;
            let module = ModuleId::from(binding.module);
            if !interfaces[binding.module].inputs.iter().any(|i| i == &binding.interface) {
                return Err(PipelineError::DanglingInput {
                    module,
                    interface: binding.interface.clone(),
                });
            }
            cover(module, &binding.interface)?;
            input_bindings.insert(name.clone(), (module, binding.interface.clone()));
        }

        let mut edges = Vec::with_capacity(config.edges.len());
        for edge in &config.edges {
            check_index(edge.from.module, "edge source")?;
            check_index(edge.to.module, "edge destination")?;
            let from = ModuleId::from(edge.from.module);
            let to = ModuleId::from(edge.to.module);
            if !interfaces[edge.from.module].outputs.iter().any(|o| o == &edge.from.interface) {
                return Err(PipelineError::ConfigParse(format!(
                    "edge source names output {:?}, which module {} does not declare",
                    edge.from.interface, from
                )));
            }
            if !interfaces[edge.to.module].inputs.iter().any(|i| i == &edge.to.interface) {
                return Err(PipelineError::DanglingInput {
                    module: to,
                    interface: edge.to.interface.clone(),
                });
            }
            cover(to, &edge.to.interface)?;
            edges.push(Edge {
                from: EdgeEnd { module: from, interface: edge.from.interface.clone() },
                to: EdgeEnd { module: to, interface: edge.to.interface.clone() },
            });
        }

        // Every declared input must now be covered.
        for (index, iface) in interfaces.iter().enumerate() {
            for input in &iface.inputs {
                if !covered.contains_key(&(index, input.clone())) {
                    return Err(PipelineError::DanglingInput {
                        module: ModuleId::from(index),
                        interface: input.clone(),
                    });
                }
            }
        }

        let mut param_groups = BTreeMap::new();
        for (name, &index) in &config.param_groups {
            check_index(index, &format!("parameter group {name:?}"))?;
            param_groups.insert(name.clone(), ModuleId::from(index));
        }

        let topo = topological_order(n, &edges)?;

        // Terminal outputs: declared outputs with no outgoing edge, in
        // ascending (module index, output-interface index) order.
        let mut terminals = Vec::new();
        for (index, iface) in interfaces.iter().enumerate() {
            for (output_index, output) in iface.outputs.iter().enumerate() {
                let consumed = edges
                    .iter()
                    .any(|e| e.from.module.index() == index && &e.from.interface == output);
                if !consumed {
                    terminals.push((ModuleId::from(index), output_index));
                }
            }
        }

        tracing::info!(
            modules = n,
            edges = edges.len(),
            inputs = input_bindings.len(),
            outputs = terminals.len(),
            "pipeline graph validated"
        );

        Ok(Self {
            specs,
            interfaces,
            input_bindings,
            param_groups,
            edges,
            topo,
            terminals,
            queue_depth: config.queue_depth,
        })
    }

    /// Count of terminal output interfaces, fixed after construction.
    pub fn num_outputs(&self) -> usize {
        self.terminals.len()
    }

    /// Number of modules in the pipeline.
    pub fn num_modules(&self) -> usize {
        self.specs.len()
    }

    /// Resolve a global input name to its module input slot.
    pub fn resolve_input(&self, name: &str) -> Result<(ModuleId, &str)> {
        self.input_bindings
            .get(name)
            .map(|(module, interface)| (*module, interface.as_str()))
            .ok_or_else(|| PipelineError::UnknownName(name.to_string()))
    }

    /// Resolve a parameter-group name to its owning module.
    pub fn resolve_param_group(&self, name: &str) -> Result<ModuleId> {
        self.param_groups
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::UnknownName(name.to_string()))
    }

    /// The validated linear stage order.
    pub fn topo_order(&self) -> &[ModuleId] {
        &self.topo
    }

    /// Terminal output slots in their stable numbering.
    pub fn terminal_outputs(&self) -> &[(ModuleId, usize)] {
        &self.terminals
    }

    pub fn module_spec(&self, id: ModuleId) -> &ModuleSpec {
        &self.specs[id.index()]
    }

    pub fn module_interfaces(&self, id: ModuleId) -> &ModuleInterfaces {
        &self.interfaces[id.index()]
    }

    pub fn input_bindings(&self) -> &BTreeMap<String, (ModuleId, String)> {
        &self.input_bindings
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }
}

/// Kahn's algorithm with a min-heap frontier so ties always break toward
/// the lowest module index. Remaining vertices after the frontier drains
/// mean a cycle.
fn topological_order(n: usize, edges: &[Edge]) -> Result<Vec<ModuleId>> {
    let mut in_degree = vec![0u32; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];

    for edge in edges {
        adj[edge.from.module.index()].push(edge.to.module.index());
        in_degree[edge.to.module.index()] += 1;
    }

    let mut frontier: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);

    while let Some(Reverse(index)) = frontier.pop() {
        order.push(ModuleId::from(index));
        for &next in &adj[index] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                frontier.push(Reverse(next));
            }
        }
    }

    if order.len() != n {
        tracing::warn!(
            scheduled = order.len(),
            total = n,
            "pipeline graph has a cycle"
        );
        return Err(PipelineError::Cycle);
    }

    Ok(order)
}
