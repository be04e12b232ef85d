//! The pipeline executor facade.
//!
//! Thin, stateful wrapper over the validated graph and the running
//! scheduler. Contains no routing logic of its own: every operation
//! validates and forwards.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::module::InferenceModule;
use crate::pipeline::graph::{ModuleInterfaces, PipelineGraph};
use crate::pipeline::scheduler::{
    PipelineScheduler, SampleHandle, SharedModule, ShutdownMode,
};
use crate::types::{Tensor, TensorMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The stable API surface external callers use.
///
/// Built once by [`PipelineExecutor::init`]; the graph is immutable
/// afterwards and the scheduler's workers run until shutdown (explicit
/// or on drop).
pub struct PipelineExecutor {
    graph: Arc<PipelineGraph>,
    modules: Vec<SharedModule>,
    scheduler: PipelineScheduler,
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("graph", &self.graph)
            .field("modules", &self.modules.len())
            .finish_non_exhaustive()
    }
}

impl PipelineExecutor {
    /// Build the graph from `config` and the interfaces the modules
    /// declare, then start the scheduler. Fails fast on any validation
    /// error; no worker thread starts unless the whole configuration is
    /// valid.
    pub fn init(
        modules: Vec<Box<dyn InferenceModule>>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        if modules.is_empty() {
            return Err(PipelineError::ConfigParse(
                "the module list is empty".to_string(),
            ));
        }
        if modules.len() != config.modules.len() {
            return Err(PipelineError::ConfigParse(format!(
                "{} modules provided but the module table has {} entries",
                modules.len(),
                config.modules.len()
            )));
        }

        let interfaces = modules
            .iter()
            .map(|module| ModuleInterfaces {
                inputs: module.declared_inputs(),
                outputs: module.declared_outputs(),
            })
            .collect();
        let graph = PipelineGraph::build(config, interfaces)?;

        let modules: Vec<SharedModule> = modules
            .into_iter()
            .map(|module| Arc::new(Mutex::new(module)))
            .collect();
        let scheduler = PipelineScheduler::start(&graph, &modules)?;

        tracing::info!(modules = modules.len(), "pipeline executor initialized");
        Ok(Self {
            graph: Arc::new(graph),
            modules,
            scheduler,
        })
    }

    /// Count of terminal output interfaces; stable for the lifetime of
    /// the executor.
    pub fn num_outputs(&self) -> usize {
        self.graph.num_outputs()
    }

    /// Resolve a global input name to `(module index as string, module
    /// input interface name)`.
    pub fn get_input_pipeline_map(&self, name: &str) -> Result<(String, String)> {
        let (module, interface) = self.graph.resolve_input(name)?;
        Ok((module.to_string(), interface.to_string()))
    }

    /// Resolve a parameter-group name to its owning module index.
    pub fn get_params_group_pipeline_map(&self, name: &str) -> Result<usize> {
        Ok(self.graph.resolve_param_group(name)?.index())
    }

    /// Apply a parameter value to the module owning `group`.
    ///
    /// Rejected with [`PipelineError::NotIdle`] while any sample is in
    /// flight; the per-module lock then guarantees the application never
    /// races `run`.
    pub fn set_param(&self, group: &str, key: &str, value: &Tensor) -> Result<()> {
        let module = self.graph.resolve_param_group(group)?;
        if !self.scheduler.is_idle() {
            return Err(PipelineError::NotIdle);
        }
        let mut guard = match self.modules[module.index()].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard
            .apply_parameter(key, value)
            .map_err(|error| PipelineError::ParameterApply {
                module,
                message: error.to_string(),
            })
    }

    /// Submit one sample's global inputs. Blocks when first-stage queues
    /// are full.
    pub fn submit(&self, inputs: TensorMap) -> Result<SampleHandle> {
        self.scheduler.submit(&inputs)
    }

    /// Block until the sample completes; outputs are in terminal-output
    /// order.
    pub fn collect(&self, handle: SampleHandle) -> Result<Vec<Tensor>> {
        self.scheduler.collect(handle)
    }

    /// Submit one sample and wait for its outputs.
    pub fn run_once(&self, inputs: TensorMap) -> Result<Vec<Tensor>> {
        let handle = self.submit(inputs)?;
        self.collect(handle)
    }

    /// Structural view of the pipeline.
    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Shut the scheduler down cooperatively. Idempotent.
    pub fn shutdown(&mut self, mode: ShutdownMode, timeout: Duration) -> Result<()> {
        self.scheduler.shutdown(mode, timeout)
    }
}
