//! Stage-graph pipeline execution.
//!
//! Independently compiled inference modules run as stages of one logical
//! pipeline:
//!
//! ```text
//! [Global inputs] ──► [Module 0] ──► [Module 1] ──► [Terminal outputs]
//!                              └───► [Module 2] ──┘
//! ```
//!
//! # Design
//!
//! - **Validated once** — [`PipelineGraph`] proves input coverage and
//!   acyclicity at init; immutable afterwards, no locking needed.
//! - **Worker per stage** — [`PipelineScheduler`] overlaps successive
//!   samples across stages; bounded edge queues provide backpressure.
//! - **Per-sample failure containment** — a failed sample travels its
//!   edges as a marker; other samples are unaffected.
//! - **Cooperative shutdown** — sentinel propagation through every queue,
//!   bounded by a caller-supplied timeout.

pub mod executor;
pub mod graph;
pub mod id;
pub mod scheduler;

pub use executor::PipelineExecutor;
pub use graph::{Edge, EdgeEnd, ModuleInterfaces, ModuleSpec, PipelineGraph};
pub use id::{ModuleId, SampleId};
pub use scheduler::{
    PipelineScheduler, SampleHandle, SharedModule, ShutdownMode, DEFAULT_SHUTDOWN_TIMEOUT,
};
