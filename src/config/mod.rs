//! Pipeline configuration loading.
//!
//! The configuration document is a single JSON object describing the
//! module table, the global input routing table, the parameter-group
//! table and the inter-module edges:
//!
//! ```json
//! {
//!   "modules":      [ { "artifact": "det.so", "weights": "det.params", "device": "1;0" } ],
//!   "inputs":       { "image": { "module": 0, "interface": "input" } },
//!   "param_groups": { "backbone": 0 },
//!   "edges":        [ { "from": { "module": 0, "interface": "output" },
//!                       "to":   { "module": 1, "interface": "input" } } ],
//!   "queue_depth":  4
//! }
//! ```
//!
//! Parsing here is purely structural; referential checks (module indices
//! in range, interfaces declared) happen during graph construction,
//! before any execution.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default bounded capacity of each inter-stage queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

/// One entry of the module table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Reference to the compiled-graph artifact.
    pub artifact: String,

    /// Reference to the serialized weights.
    #[serde(default)]
    pub weights: String,

    /// Target device descriptor, `"<kind>;<ordinal>"` with both fields
    /// optional.
    #[serde(default)]
    pub device: String,
}

/// Routing entry for one global pipeline input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputBindingConfig {
    /// Index into the module table.
    pub module: usize,

    /// Module-local input interface name.
    pub interface: String,
}

/// One endpoint of an inter-module edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub module: usize,
    pub interface: String,
}

/// A directed data dependency between two module interfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub from: Endpoint,
    pub to: Endpoint,
}

/// The full, typed pipeline configuration document.
///
/// Maps use `BTreeMap` so iteration order (and thus every derived
/// structure) is deterministic. Duplicate keys within the document are
/// impossible once deserialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Module table, indexed by position.
    pub modules: Vec<ModuleConfig>,

    /// Global input name → module input slot.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputBindingConfig>,

    /// Parameter-group name → owning module index.
    #[serde(default)]
    pub param_groups: BTreeMap<String, usize>,

    /// Inter-module edges.
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,

    /// Bounded capacity of each inter-stage queue. Must be at least 1.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl PipelineConfig {
    /// Parse a configuration document from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration document from a file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Structural checks that do not need module interfaces.
    fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(PipelineError::ConfigParse(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
