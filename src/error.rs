//! Error handling for the pipeline executor.
//!
//! Every failure class a caller can observe has its own variant so that
//! callers can match on the kind rather than parse messages. Structural
//! and configuration errors are fatal to initialization; `ModuleExecution`
//! is scoped to a single sample.

use crate::pipeline::id::{ModuleId, SampleId};
use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The configuration document is malformed or fails referential checks.
    #[error("Config parse error: {0}")]
    ConfigParse(String),

    /// A module input interface has no source, or a binding names an
    /// input interface the module does not declare.
    #[error("Dangling input: module {module} interface {interface:?} has no source")]
    DanglingInput { module: ModuleId, interface: String },

    /// A module input interface is fed by more than one source.
    #[error("Duplicate binding: module {module} interface {interface:?} bound twice")]
    DuplicateBinding { module: ModuleId, interface: String },

    /// The stage graph contains a directed cycle.
    #[error("Cycle detected in pipeline graph")]
    Cycle,

    /// Lookup miss for a global input name or parameter-group name.
    #[error("Unknown name: {0:?}")]
    UnknownName(String),

    /// A bound global input was not provided at submission.
    #[error("Missing input: {0:?} was not provided")]
    MissingInput(String),

    /// A module's `run` failed for one sample. Other samples are unaffected.
    #[error("Module {module} failed executing sample {sample}")]
    ModuleExecution { module: ModuleId, sample: SampleId },

    /// A module rejected a parameter application (unknown key or
    /// incompatible value).
    #[error("Module {module} rejected parameter: {message}")]
    ParameterApply { module: ModuleId, message: String },

    /// The operation requires an idle pipeline but samples are in flight.
    #[error("Pipeline is not idle")]
    NotIdle,

    /// Cooperative shutdown did not complete within the given bound.
    #[error("Shutdown did not complete within the timeout")]
    ShutdownTimeout,

    /// An internal channel disconnected, typically because the pipeline
    /// was shut down while results were still pending.
    #[error("Pipeline channel closed")]
    ChannelClosed,

    /// IO errors (configuration file loading).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
