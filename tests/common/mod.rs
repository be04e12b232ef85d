//! Common test utilities and stage stubs.

#![allow(dead_code)] // Test utilities may not all be used in every test file

use inferpipe::{InferenceModule, ModuleError, Tensor, TensorMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Initialize tracing once for the test binary (RUST_LOG respected).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Build a `TensorMap` holding one scalar under `name`.
pub fn scalar_input(name: &str, value: f32) -> TensorMap {
    let mut inputs = TensorMap::new();
    inputs.insert(name.to_string(), Tensor::scalar(value));
    inputs
}

/// A deterministic stage: sums its inputs element-wise (all inputs must
/// share a shape), adds `offset`, and emits the result on every declared
/// output. Optional artificial latency and failure injection.
pub struct ArithModule {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    offset: f32,
    delay: Option<Duration>,
    /// Samples (by arrival order at this module) that `run` should fail.
    fail_on: Vec<u64>,
    /// Declared outputs to leave out of the result map on given runs.
    omit_on: Vec<(u64, String)>,
    runs: Arc<AtomicUsize>,
    params: Vec<(String, Tensor)>,
}

impl ArithModule {
    pub fn new(name: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            offset: 0.0,
            delay: None,
            fail_on: Vec::new(),
            omit_on: Vec::new(),
            runs: Arc::new(AtomicUsize::new(0)),
            params: Vec::new(),
        }
    }

    pub fn with_offset(mut self, offset: f32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the nth invocation of `run` (0-based arrival order).
    pub fn failing_on(mut self, nth: u64) -> Self {
        self.fail_on.push(nth);
        self
    }

    /// On the nth invocation, leave `output` out of the result map even
    /// though it stays declared.
    pub fn omitting_output_on(mut self, nth: u64, output: &str) -> Self {
        self.omit_on.push((nth, output.to_string()));
        self
    }

    /// Shared counter of completed `run` calls.
    pub fn run_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.runs)
    }

    pub fn boxed(self) -> Box<dyn InferenceModule> {
        Box::new(self)
    }
}

impl InferenceModule for ArithModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn declared_inputs(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn declared_outputs(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn run(&mut self, inputs: &TensorMap) -> Result<TensorMap, ModuleError> {
        let nth = self.runs.fetch_add(1, Ordering::SeqCst) as u64;
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail_on.contains(&nth) {
            return Err(ModuleError::new(format!("injected failure on run {nth}")));
        }

        let first = self
            .inputs
            .first()
            .and_then(|name| inputs.get(name))
            .ok_or_else(|| ModuleError::new("missing input"))?;
        let shape = first.shape().to_vec();
        let mut data = vec![self.offset; first.len()];
        for name in &self.inputs {
            let tensor = inputs
                .get(name)
                .ok_or_else(|| ModuleError::new(format!("missing input {name:?}")))?;
            if tensor.shape() != shape.as_slice() {
                return Err(ModuleError::new("input shape mismatch"));
            }
            for (acc, v) in data.iter_mut().zip(tensor.data()) {
                *acc += v;
            }
        }

        let result = Tensor::new(shape, data).map_err(|e| ModuleError::new(e.to_string()))?;
        let mut outputs = TensorMap::new();
        for output in &self.outputs {
            outputs.insert(output.clone(), result.clone());
        }
        for (n, output) in &self.omit_on {
            if *n == nth {
                outputs.remove(output);
            }
        }
        Ok(outputs)
    }

    fn apply_parameter(&mut self, key: &str, value: &Tensor) -> Result<(), ModuleError> {
        if key == "offset" {
            self.offset = value
                .data()
                .first()
                .copied()
                .ok_or_else(|| ModuleError::new("offset expects a scalar"))?;
            self.params.push((key.to_string(), value.clone()));
            return Ok(());
        }
        Err(ModuleError::new(format!("unknown parameter key {key:?}")))
    }
}

/// Tracks how many produced-but-unconsumed items sit between two stages,
/// to observe backpressure. The producer side calls `produced` after its
/// `run` returns, the consumer side calls `consumed` when its `run`
/// starts; the peak is the high-water mark of items buffered in between.
#[derive(Clone, Default)]
pub struct OccupancyProbe {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl OccupancyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn produced(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn consumed(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Identity stage that reports to an `OccupancyProbe` on the producer or
/// consumer side, with optional latency.
pub struct ProbedModule {
    name: String,
    delay: Option<Duration>,
    produced: Option<OccupancyProbe>,
    consumed: Option<OccupancyProbe>,
}

impl ProbedModule {
    pub fn producer(name: &str, probe: OccupancyProbe) -> Self {
        Self {
            name: name.to_string(),
            delay: None,
            produced: Some(probe),
            consumed: None,
        }
    }

    pub fn consumer(name: &str, probe: OccupancyProbe) -> Self {
        Self {
            name: name.to_string(),
            delay: None,
            produced: None,
            consumed: Some(probe),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn boxed(self) -> Box<dyn InferenceModule> {
        Box::new(self)
    }
}

impl InferenceModule for ProbedModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn declared_inputs(&self) -> Vec<String> {
        vec!["input".to_string()]
    }

    fn declared_outputs(&self) -> Vec<String> {
        vec!["output".to_string()]
    }

    fn run(&mut self, inputs: &TensorMap) -> Result<TensorMap, ModuleError> {
        if let Some(probe) = &self.consumed {
            probe.consumed();
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let mut outputs = TensorMap::new();
        outputs.insert(
            "output".to_string(),
            inputs
                .get("input")
                .cloned()
                .ok_or_else(|| ModuleError::new("missing input"))?,
        );
        if let Some(probe) = &self.produced {
            probe.produced();
        }
        Ok(outputs)
    }

    fn apply_parameter(&mut self, _key: &str, _value: &Tensor) -> Result<(), ModuleError> {
        Err(ModuleError::new("no parameters"))
    }
}

/// A stage that blocks until told to finish, for wedged-shutdown tests.
pub struct StallModule {
    name: String,
    release: Arc<AtomicBool>,
}

impl StallModule {
    pub fn new(name: &str) -> (Self, Arc<AtomicBool>) {
        let release = Arc::new(AtomicBool::new(false));
        (
            Self {
                name: name.to_string(),
                release: Arc::clone(&release),
            },
            release,
        )
    }

    pub fn boxed(self) -> Box<dyn InferenceModule> {
        Box::new(self)
    }
}

impl InferenceModule for StallModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn declared_inputs(&self) -> Vec<String> {
        vec!["input".to_string()]
    }

    fn declared_outputs(&self) -> Vec<String> {
        vec!["output".to_string()]
    }

    fn run(&mut self, inputs: &TensorMap) -> Result<TensorMap, ModuleError> {
        while !self.release.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        let mut outputs = TensorMap::new();
        outputs.insert(
            "output".to_string(),
            inputs
                .get("input")
                .cloned()
                .ok_or_else(|| ModuleError::new("missing input"))?,
        );
        Ok(outputs)
    }

    fn apply_parameter(&mut self, _key: &str, _value: &Tensor) -> Result<(), ModuleError> {
        Err(ModuleError::new("no parameters"))
    }
}
