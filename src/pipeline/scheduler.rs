//! The concurrency core: executes samples through the validated graph.
//!
//! One worker thread per module. Every module input interface is backed
//! by a bounded single-producer/single-consumer queue whose producer is
//! either the upstream worker or the submitter (for globally bound
//! inputs). Push blocks when a queue is full (backpressure), pop blocks
//! when it is empty, and those are the only suspension points besides the
//! module's own `run`.
//!
//! Failure containment: a failed sample travels the same edges as a
//! payload would, as a `Failed` marker carrying the origin module, so
//! joins never deadlock on a failed branch and other samples on the same
//! edges are untouched. Shutdown propagates a `Shutdown` sentinel through
//! every queue; workers unwind and report on a done-channel the shutdown
//! call waits on with a deadline.

use crate::error::{PipelineError, Result};
use crate::module::InferenceModule;
use crate::pipeline::graph::PipelineGraph;
use crate::pipeline::id::{ModuleId, SampleId};
use crate::types::{Tensor, TensorMap};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default bound for implicit shutdown on drop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle type for a module owned by its worker. The facade takes
/// the same lock for `apply_parameter`, which together with the idle gate
/// guarantees parameter application never races `run`.
pub type SharedModule = Arc<Mutex<Box<dyn InferenceModule>>>;

/// How in-flight samples are treated at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Finish all submitted samples before unwinding.
    Drain,
    /// Discard in-flight work and unwind as fast as possible.
    Abandon,
}

/// An item travelling on one edge queue.
#[derive(Debug, Clone)]
enum EdgeItem {
    /// One sample's tensor for this interface.
    Payload { sample: SampleId, tensor: Tensor },
    /// The sample failed upstream; carries the failing module.
    Failed { sample: SampleId, origin: ModuleId },
    /// Cooperative shutdown sentinel. Nothing follows it on this queue.
    Shutdown,
}

/// What a worker gathered for one input interface of one sample.
enum Gathered {
    Tensor(Tensor),
    Failed(ModuleId),
}

/// A terminal output (or failure marker) arriving at the collector.
struct TerminalItem {
    sample: SampleId,
    slot: usize,
    payload: std::result::Result<Tensor, ModuleId>,
}

/// Caller-side handle for one submitted sample.
pub struct SampleHandle {
    pub id: SampleId,
    rx: Receiver<Result<Vec<Tensor>>>,
}

/// Accumulates terminal outputs for one in-flight sample.
struct PendingSample {
    outputs: Vec<Option<Tensor>>,
    received: usize,
    failed: Option<ModuleId>,
    tx: Sender<Result<Vec<Tensor>>>,
}

type PendingMap = Arc<Mutex<HashMap<SampleId, PendingSample>>>;

fn lock_pending(map: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<SampleId, PendingSample>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Worker ──

struct InputPort {
    interface: String,
    rx: Receiver<EdgeItem>,
    /// Items that arrived ahead of the sample currently being gathered.
    /// Correlation is by sample identity, not arrival order.
    stash: BTreeMap<SampleId, Gathered>,
}

struct OutputRoute {
    interface: String,
    /// Downstream edge queues fed by this interface (fan-out clones).
    targets: Vec<Sender<EdgeItem>>,
    /// Slot in the pipeline's terminal output numbering, if unconsumed.
    terminal_slot: Option<usize>,
}

struct StageWorker {
    id: ModuleId,
    module: SharedModule,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputRoute>,
    results_tx: Sender<TerminalItem>,
    abandon: Arc<AtomicBool>,
    done_tx: Sender<ModuleId>,
}

impl StageWorker {
    fn run(mut self) {
        let mut sample = SampleId(0);
        loop {
            if self.abandon.load(Ordering::Relaxed) {
                break;
            }
            let Some((inputs, failure)) = self.gather(sample) else {
                break;
            };
            if self.abandon.load(Ordering::Relaxed) {
                break;
            }

            let ok = match failure {
                Some(origin) => self.forward_failure(sample, origin),
                None => self.execute(sample, &inputs),
            };
            if !ok {
                break;
            }
            sample = sample.next();
        }

        // Unwind: pass the sentinel on so downstream workers also exit.
        for route in &self.outputs {
            for tx in &route.targets {
                let _ = tx.send(EdgeItem::Shutdown);
            }
        }
        tracing::debug!(module = %self.id, "stage worker exiting");
        let _ = self.done_tx.send(self.id);
    }

    /// Pull the complete input set for `sample` from every input queue.
    /// Returns `None` on shutdown (sentinel or disconnect). The second
    /// element is the failure origin if any branch failed this sample.
    fn gather(&mut self, sample: SampleId) -> Option<(TensorMap, Option<ModuleId>)> {
        let mut inputs = TensorMap::with_capacity(self.inputs.len());
        let mut failure = None;
        for port in &mut self.inputs {
            let gathered = loop {
                if let Some(item) = port.stash.remove(&sample) {
                    break item;
                }
                match port.rx.recv() {
                    Err(_) | Ok(EdgeItem::Shutdown) => return None,
                    Ok(EdgeItem::Payload { sample: s, tensor }) => {
                        if s == sample {
                            break Gathered::Tensor(tensor);
                        }
                        port.stash.insert(s, Gathered::Tensor(tensor));
                    }
                    Ok(EdgeItem::Failed { sample: s, origin }) => {
                        if s == sample {
                            break Gathered::Failed(origin);
                        }
                        port.stash.insert(s, Gathered::Failed(origin));
                    }
                }
            };
            match gathered {
                Gathered::Tensor(tensor) => {
                    inputs.insert(port.interface.clone(), tensor);
                }
                Gathered::Failed(origin) => failure = Some(origin),
            }
        }
        Some((inputs, failure))
    }

    /// Run the module on one gathered input set and route its outputs.
    /// Returns false when a downstream queue disconnected (shutdown).
    fn execute(&mut self, sample: SampleId, inputs: &TensorMap) -> bool {
        let result = {
            let mut module = match self.module.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            module.run(inputs)
        };

        let mut outputs = match result {
            Ok(outputs) => outputs,
            Err(error) => {
                tracing::warn!(module = %self.id, %sample, %error, "module run failed");
                return self.forward_failure(sample, self.id);
            }
        };

        // A module that omits a declared output fails the whole sample;
        // nothing is routed so other samples stay consistent.
        if self.outputs.iter().any(|r| !outputs.contains_key(&r.interface)) {
            tracing::warn!(module = %self.id, %sample, "module omitted a declared output");
            return self.forward_failure(sample, self.id);
        }

        for route in &self.outputs {
            let tensor = match outputs.remove(&route.interface) {
                Some(tensor) => tensor,
                None => return self.forward_failure(sample, self.id),
            };
            for tx in &route.targets {
                let item = EdgeItem::Payload {
                    sample,
                    tensor: tensor.clone(),
                };
                if tx.send(item).is_err() {
                    return false;
                }
            }
            if let Some(slot) = route.terminal_slot {
                let item = TerminalItem {
                    sample,
                    slot,
                    payload: Ok(tensor),
                };
                if self.results_tx.send(item).is_err() {
                    return false;
                }
            }
        }
        true
    }

    /// Mark `sample` as failed on every outgoing edge and terminal slot.
    fn forward_failure(&self, sample: SampleId, origin: ModuleId) -> bool {
        for route in &self.outputs {
            for tx in &route.targets {
                if tx.send(EdgeItem::Failed { sample, origin }).is_err() {
                    return false;
                }
            }
            if let Some(slot) = route.terminal_slot {
                let item = TerminalItem {
                    sample,
                    slot,
                    payload: Err(origin),
                };
                if self.results_tx.send(item).is_err() {
                    return false;
                }
            }
        }
        true
    }
}

// ── Collector ──

/// Aggregates terminal items per sample and completes the submitter's
/// handle once every slot has reported, so outputs of different samples
/// are never interleaved on a slot.
fn run_collector(
    results_rx: Receiver<TerminalItem>,
    pending: PendingMap,
    in_flight: Arc<AtomicUsize>,
    num_outputs: usize,
    done_tx: Sender<()>,
) {
    while let Ok(item) = results_rx.recv() {
        let finished = {
            let mut map = lock_pending(&pending);
            let Some(entry) = map.get_mut(&item.sample) else {
                tracing::warn!(sample = %item.sample, "terminal item for unknown sample");
                continue;
            };
            entry.received += 1;
            match item.payload {
                Ok(tensor) => entry.outputs[item.slot] = Some(tensor),
                Err(origin) => entry.failed = Some(origin),
            }
            if entry.received == num_outputs {
                map.remove(&item.sample)
            } else {
                None
            }
        };

        if let Some(entry) = finished {
            in_flight.fetch_sub(1, Ordering::Release);
            let result = finalize(item.sample, entry.failed, entry.outputs);
            let _ = entry.tx.send(result);
        }
    }

    // All workers unwound. Fail whatever is still pending (abandoned).
    let mut map = lock_pending(&pending);
    for (sample, entry) in map.drain() {
        tracing::debug!(%sample, "sample abandoned at shutdown");
        in_flight.fetch_sub(1, Ordering::Release);
        let _ = entry.tx.send(Err(PipelineError::ChannelClosed));
    }
    let _ = done_tx.send(());
}

fn finalize(
    sample: SampleId,
    failed: Option<ModuleId>,
    outputs: Vec<Option<Tensor>>,
) -> Result<Vec<Tensor>> {
    if let Some(module) = failed {
        return Err(PipelineError::ModuleExecution { module, sample });
    }
    let expected = outputs.len();
    let tensors: Vec<Tensor> = outputs.into_iter().flatten().collect();
    if tensors.len() != expected {
        // Every slot reported and none failed, so this cannot happen
        // unless a worker misrouted a slot index.
        tracing::warn!(%sample, "terminal accumulator incomplete");
        return Err(PipelineError::ChannelClosed);
    }
    Ok(tensors)
}

// ── Scheduler ──

/// Owns the worker threads and all plumbing for submitting samples and
/// collecting their terminal outputs.
pub struct PipelineScheduler {
    /// Global input name → the queue of the module interface it binds.
    feeds: BTreeMap<String, Sender<EdgeItem>>,
    /// Serializes id allocation and input pushes so concurrent submitters
    /// cannot interleave samples within one queue.
    submit_lock: Mutex<SampleId>,
    pending: PendingMap,
    in_flight: Arc<AtomicUsize>,
    abandon: Arc<AtomicBool>,
    worker_done_rx: Receiver<ModuleId>,
    collector_done_rx: Receiver<()>,
    num_workers: usize,
    num_outputs: usize,
    shut_down: bool,
}

impl PipelineScheduler {
    /// Wire the queues and spawn one worker per module plus the terminal
    /// collector. `modules[i]` must be the module at table index `i`.
    pub fn start(graph: &PipelineGraph, modules: &[SharedModule]) -> Result<Self> {
        let n = graph.num_modules();
        let depth = graph.queue_depth();

        // One bounded queue per module input interface. The sender clones
        // taken out of this map go to exactly one producer each; the map
        // itself is dropped after wiring so queues disconnect cleanly.
        let mut input_txs: HashMap<(usize, String), Sender<EdgeItem>> = HashMap::new();
        let mut worker_inputs: Vec<Vec<InputPort>> = Vec::with_capacity(n);
        for index in 0..n {
            let iface = graph.module_interfaces(ModuleId::from(index));
            let mut ports = Vec::with_capacity(iface.inputs.len());
            for input in &iface.inputs {
                let (tx, rx) = bounded(depth);
                input_txs.insert((index, input.clone()), tx);
                ports.push(InputPort {
                    interface: input.clone(),
                    rx,
                    stash: BTreeMap::new(),
                });
            }
            worker_inputs.push(ports);
        }

        let mut feeds = BTreeMap::new();
        for (name, (module, interface)) in graph.input_bindings() {
            let tx = input_txs[&(module.index(), interface.clone())].clone();
            feeds.insert(name.clone(), tx);
        }

        let num_outputs = graph.num_outputs();
        let results_cap = (depth * num_outputs).max(1);
        let (results_tx, results_rx) = bounded(results_cap);
        let (worker_done_tx, worker_done_rx) = bounded(n);
        let (collector_done_tx, collector_done_rx) = bounded(1);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let abandon = Arc::new(AtomicBool::new(false));

        let terminals = graph.terminal_outputs();
        let mut worker_inputs = worker_inputs.into_iter();
        for index in 0..n {
            let id = ModuleId::from(index);
            let iface = graph.module_interfaces(id);
            let outputs = iface
                .outputs
                .iter()
                .enumerate()
                .map(|(output_index, output)| {
                    let targets = graph
                        .edges()
                        .iter()
                        .filter(|e| e.from.module == id && &e.from.interface == output)
                        .map(|e| input_txs[&(e.to.module.index(), e.to.interface.clone())].clone())
                        .collect::<Vec<_>>();
                    let terminal_slot = terminals
                        .iter()
                        .position(|&(module, oi)| module == id && oi == output_index);
                    OutputRoute {
                        interface: output.clone(),
                        targets,
                        terminal_slot,
                    }
                })
                .collect::<Vec<_>>();

            let worker = StageWorker {
                id,
                module: Arc::clone(&modules[index]),
                inputs: worker_inputs.next().unwrap_or_default(),
                outputs,
                results_tx: results_tx.clone(),
                abandon: Arc::clone(&abandon),
                done_tx: worker_done_tx.clone(),
            };
            std::thread::Builder::new()
                .name(format!("pipeline-stage-{index}"))
                .spawn(move || worker.run())?;
        }
        drop(results_tx);
        drop(worker_done_tx);
        drop(input_txs);

        {
            let pending = Arc::clone(&pending);
            let in_flight = Arc::clone(&in_flight);
            std::thread::Builder::new()
                .name("pipeline-collector".to_string())
                .spawn(move || {
                    run_collector(results_rx, pending, in_flight, num_outputs, collector_done_tx)
                })?;
        }

        tracing::info!(workers = n, depth, num_outputs, "pipeline scheduler started");

        Ok(Self {
            feeds,
            submit_lock: Mutex::new(SampleId(0)),
            pending,
            in_flight,
            abandon,
            worker_done_rx,
            collector_done_rx,
            num_workers: n,
            num_outputs,
            shut_down: false,
        })
    }

    /// True when no submitted sample is still in flight.
    ///
    /// Only samples with a terminal output to report are tracked: with an
    /// empty terminal set there is no completion signal, so such samples
    /// count as done at submission and the idle gate does not cover them.
    /// The per-module mutex still keeps parameter application from racing
    /// `run` in that case.
    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }

    /// Submit one sample. Blocks when first-stage queues are full
    /// (backpressure) until downstream workers make room.
    pub fn submit(&self, inputs: &TensorMap) -> Result<SampleHandle> {
        if self.shut_down {
            return Err(PipelineError::ChannelClosed);
        }
        for name in inputs.keys() {
            if !self.feeds.contains_key(name) {
                return Err(PipelineError::UnknownName(name.clone()));
            }
        }
        for name in self.feeds.keys() {
            if !inputs.contains_key(name) {
                return Err(PipelineError::MissingInput(name.clone()));
            }
        }

        let mut counter = match self.submit_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let sample = *counter;
        *counter = counter.next();

        let (tx, rx) = bounded(1);
        if self.num_outputs == 0 {
            // No terminal slots to wait for; the sample completes
            // trivially and is not tracked by the idle gate (see
            // `is_idle`).
            let _ = tx.send(Ok(Vec::new()));
        } else {
            lock_pending(&self.pending).insert(
                sample,
                PendingSample {
                    outputs: vec![None; self.num_outputs],
                    received: 0,
                    failed: None,
                    tx,
                },
            );
            self.in_flight.fetch_add(1, Ordering::Release);
        }

        for (name, feed) in &self.feeds {
            let item = EdgeItem::Payload {
                sample,
                tensor: inputs[name].clone(),
            };
            if feed.send(item).is_err() {
                if let Some(entry) = lock_pending(&self.pending).remove(&sample) {
                    self.in_flight.fetch_sub(1, Ordering::Release);
                    drop(entry);
                }
                return Err(PipelineError::ChannelClosed);
            }
        }
        tracing::debug!(%sample, "sample submitted");
        Ok(SampleHandle { id: sample, rx })
    }

    /// Block until the sample's outputs (or its failure) are available.
    pub fn collect(&self, handle: SampleHandle) -> Result<Vec<Tensor>> {
        handle
            .rx
            .recv()
            .map_err(|_| PipelineError::ChannelClosed)?
    }

    /// Broadcast the shutdown signal and wait for all workers and the
    /// collector to unwind, bounded by `timeout`.
    pub fn shutdown(&mut self, mode: ShutdownMode, timeout: Duration) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        let deadline = Instant::now() + timeout;
        tracing::info!(?mode, "pipeline shutting down");

        if mode == ShutdownMode::Abandon {
            self.abandon.store(true, Ordering::Relaxed);
        }

        // Sentinels follow all submitted work on each feed. A wedged
        // first stage can keep its feed full, so pushing is bounded too.
        let feeds = std::mem::take(&mut self.feeds);
        for feed in feeds.values() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match feed.send_timeout(EdgeItem::Shutdown, remaining) {
                Ok(()) | Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {}
                Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => {
                    return Err(PipelineError::ShutdownTimeout);
                }
            }
        }
        drop(feeds);

        for _ in 0..self.num_workers {
            if self.worker_done_rx.recv_deadline(deadline).is_err() {
                return Err(PipelineError::ShutdownTimeout);
            }
        }
        if self.collector_done_rx.recv_deadline(deadline).is_err() {
            return Err(PipelineError::ShutdownTimeout);
        }
        tracing::info!("pipeline shutdown complete");
        Ok(())
    }
}

impl Drop for PipelineScheduler {
    fn drop(&mut self) {
        if !self.shut_down {
            let _ = self.shutdown(ShutdownMode::Abandon, DEFAULT_SHUTDOWN_TIMEOUT);
        }
    }
}
