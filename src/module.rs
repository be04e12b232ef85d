//! Adapter interface over a concrete inference module.
//!
//! The executor depends on modules only through this trait: it routes
//! tensors in, collects tensors out, and applies parameter updates. Graph
//! execution, weight loading and device binding live behind the
//! implementation and are never inspected here.

use crate::types::{Tensor, TensorMap};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Opaque failure reported by a module. The executor does not inspect
/// the cause; it maps any failure to a per-sample execution error.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct ModuleError(pub String);

impl ModuleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Capability surface the pipeline requires from any inference module.
///
/// `run` is synchronous and may block the calling worker for the duration
/// of computation. The executor guarantees `apply_parameter` is never
/// called concurrently with `run` on the same module.
#[cfg_attr(test, automock)]
pub trait InferenceModule: Send {
    /// Human-readable name, used only for diagnostics.
    fn name(&self) -> &str;

    /// Input interface names this module declares.
    fn declared_inputs(&self) -> Vec<String>;

    /// Output interface names this module declares. The position in the
    /// returned list is the output-interface index used for terminal
    /// output numbering.
    fn declared_outputs(&self) -> Vec<String>;

    /// Execute the module on one complete input set, producing one tensor
    /// per declared output.
    fn run(&mut self, inputs: &TensorMap) -> Result<TensorMap, ModuleError>;

    /// Apply a parameter value to module-owned state.
    fn apply_parameter(&mut self, key: &str, value: &Tensor) -> Result<(), ModuleError>;
}
