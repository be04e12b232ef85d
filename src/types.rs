//! Core data types shared across the pipeline executor.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque tensor payload routed between stages.
///
/// The executor never interprets tensor contents; it only moves them
/// along edges and hands them to modules. Element type is fixed to `f32`
/// since the routing layer does not need dtype polymorphism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor, checking that the shape matches the data length.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(PipelineError::ConfigParse(format!(
                "tensor shape {:?} expects {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// A rank-0 tensor holding a single value.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Named tensors crossing a module boundary, keyed by interface name.
pub type TensorMap = HashMap<String, Tensor>;

/// Target device for one module: `(kind, ordinal)`.
///
/// Parsed from the `"<kind>;<ordinal>"` form used in module tables.
/// Both fields default when omitted, so `""`, `"2"` and `"2;1"` are all
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub kind: i32,
    pub ordinal: i32,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self { kind: 1, ordinal: 0 }
    }
}

impl DeviceDescriptor {
    /// Parse a `"<kind>;<ordinal>"` descriptor string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut desc = Self::default();
        let mut parts = s.split(';');
        if let Some(kind) = parts.next().map(str::trim).filter(|p| !p.is_empty()) {
            desc.kind = kind.parse().map_err(|_| {
                PipelineError::ConfigParse(format!("malformed device kind in {s:?}"))
            })?;
        }
        if let Some(ordinal) = parts.next().map(str::trim).filter(|p| !p.is_empty()) {
            desc.ordinal = ordinal.parse().map_err(|_| {
                PipelineError::ConfigParse(format!("malformed device ordinal in {s:?}"))
            })?;
        }
        Ok(desc)
    }
}
