//! # inferpipe: pipelined executor for precompiled inference modules
//!
//! Runs a set of independently compiled inference modules as stages of a
//! single logical pipeline. The configuration document describes which
//! global inputs and parameter groups belong to which module and how
//! stage outputs feed downstream inputs; the executor validates the
//! resulting dependency graph once, then executes it with one worker per
//! stage so successive samples overlap across stages.
//!
//! ## Architecture
//!
//! - **Config**: typed JSON schema for the module table, input routing,
//!   parameter groups and edges
//! - **Graph**: validated, immutable stage DAG (coverage + acyclicity)
//! - **Scheduler**: worker threads, bounded edge queues, per-sample
//!   failure containment, cooperative shutdown
//! - **Modules**: reached only through the [`InferenceModule`] adapter
//!
//! ## Example
//!
//! ```no_run
//! use inferpipe::{PipelineConfig, PipelineExecutor, Tensor, TensorMap};
//!
//! # fn load_modules() -> Vec<Box<dyn inferpipe::InferenceModule>> { Vec::new() }
//! # fn main() -> inferpipe::Result<()> {
//! let config = PipelineConfig::from_json(
//!     r#"{
//!         "modules": [ { "artifact": "pre.so" }, { "artifact": "det.so" } ],
//!         "inputs":  { "image": { "module": 0, "interface": "input" } },
//!         "edges":   [ { "from": { "module": 0, "interface": "output" },
//!                        "to":   { "module": 1, "interface": "input" } } ]
//!     }"#,
//! )?;
//!
//! let executor = PipelineExecutor::init(load_modules(), &config)?;
//! let mut inputs = TensorMap::new();
//! inputs.insert("image".to_string(), Tensor::scalar(1.0));
//! let handle = executor.submit(inputs)?;
//! let outputs = executor.collect(handle)?;
//! # let _ = outputs;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod module;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use config::{EdgeConfig, Endpoint, InputBindingConfig, ModuleConfig, PipelineConfig};
pub use error::{PipelineError, Result};
pub use module::{InferenceModule, ModuleError};
pub use pipeline::{
    ModuleId, PipelineExecutor, PipelineGraph, SampleHandle, SampleId, ShutdownMode,
};
pub use types::{DeviceDescriptor, Tensor, TensorMap};
