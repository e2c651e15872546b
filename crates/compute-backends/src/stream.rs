//! Asynchronous command-stream backend
//!
//! Each queue owns one worker thread. Enqueued commands collect in a pending
//! batch and are submitted to the worker on `flush`, when the batch reaches
//! the configured size, or when someone waits on one of their events. The
//! worker runs commands in submission order, waiting for each command's
//! prerequisites first.
//!
//! ```text
//! enqueue ──► pending batch ──flush──► mpsc channel ──► worker thread
//!                                                         │
//!                      event resolved, then command dropped ◄┘
//! ```
//!
//! A command's bound kernel (and with it every pin) is dropped only after
//! the command's event has been resolved.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use compute_kernel::{
    cached_kernel, grid_points, register_kernel, validate_launch, validate_region, BackendKind, BackendStatus,
    BoundKernel, ComputeContext, ComputeQueue, ContextCache, ContextConfig, ContextId, Error, Event, EventSignal,
    GridRange, Kernel, MemoryRegionHandle, ProfilingClock, ProfilingInfo, Result, ValueDescription,
};
use compute_tracing::performance::record_launch;
use compute_tracing::{json_record, perf_event, perf_span};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::memory::ContextState;

type Work = Box<dyn Fn(&dyn ComputeContext) -> Result<()> + Send>;

struct Command {
    label: String,
    prereqs: Vec<Event>,
    work: Work,
    signal: EventSignal,
    queued: u64,
    submit: u64,
}

struct Shared {
    label: String,
    clock: ProfilingClock,
    pending: Mutex<Vec<Command>>,
    sender: Mutex<Option<Sender<Vec<Command>>>>,
    outstanding: Mutex<usize>,
    idle: Condvar,
}

impl Shared {
    fn flush(&self) -> Result<()> {
        let mut batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(());
        }
        let submit = self.clock.now_ns();
        for command in &mut batch {
            command.submit = submit;
        }
        perf_event!("queue_flush", queue = self.label.as_str(), commands = batch.len());
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or_else(|| {
            Error::backend(
                format!("flush {}", self.label),
                BackendStatus::DeviceNotAvailable,
                "queue is shutting down",
            )
        })?;
        sender.send(batch).map_err(|_| {
            Error::backend(
                format!("flush {}", self.label),
                BackendStatus::DeviceNotAvailable,
                "worker thread has stopped",
            )
        })
    }

    fn retire(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

/// Worker-backed queue, generic over the context its commands run against.
pub struct StreamQueue<C: ComputeContext + Clone + 'static> {
    context: C,
    label: String,
    batch_size: usize,
    profiling: bool,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: ComputeContext + Clone + 'static> StreamQueue<C> {
    pub fn new(context: C, label: &str) -> Result<Self> {
        let config = context.config().clone();
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(Shared {
            label: label.to_string(),
            clock: *context.clock(),
            pending: Mutex::new(Vec::new()),
            sender: Mutex::new(Some(sender)),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
        });

        let worker = {
            let context = context.clone();
            let shared = shared.clone();
            let profiling = config.profiling;
            thread::Builder::new()
                .name(format!("{}-{}", config.worker_name, label))
                .spawn(move || run_worker(context, shared, receiver, profiling))
                .map_err(|e| {
                    Error::backend(
                        format!("create queue {label}"),
                        BackendStatus::OutOfResources,
                        e.to_string(),
                    )
                })?
        };
        debug!(queue = label, context = %context.id(), batch = config.stream_batch_size, "started stream worker");

        Ok(Self {
            context,
            label: label.to_string(),
            batch_size: config.stream_batch_size,
            profiling: config.profiling,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn enqueue(&self, op: &str, prereqs: &[Event], work: Work) -> Result<Event> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let (event, signal) = Event::pending_with_hook(op, move || {
            if let Some(shared) = weak.upgrade() {
                if let Err(err) = shared.flush() {
                    warn!(error = %err, "flush on wait failed");
                }
            }
        });

        *self.shared.outstanding.lock() += 1;
        let pending = {
            let mut pending = self.shared.pending.lock();
            pending.push(Command {
                label: op.to_string(),
                prereqs: prereqs.to_vec(),
                work,
                signal,
                queued: self.shared.clock.now_ns(),
                submit: 0,
            });
            pending.len()
        };
        trace!(queue = %self.label, op, pending, "enqueued command");

        if self.batch_size > 0 && pending >= self.batch_size {
            self.shared.flush()?;
        }
        Ok(event)
    }

    pub fn profiling_enabled(&self) -> bool {
        self.profiling
    }
}

fn run_worker<C: ComputeContext>(context: C, shared: Arc<Shared>, receiver: Receiver<Vec<Command>>, profiling: bool) {
    for batch in receiver {
        for command in batch {
            execute(&context, &shared.clock, command, profiling);
            shared.retire();
        }
    }
    trace!(queue = %shared.label, "stream worker exiting");
}

fn execute(context: &dyn ComputeContext, clock: &ProfilingClock, command: Command, profiling: bool) {
    let Command {
        label,
        prereqs,
        work,
        signal,
        queued,
        submit,
    } = command;

    let mut start = 0;
    let mut end = 0;
    let outcome = Event::wait_all(&prereqs).and_then(|()| {
        start = clock.now_ns();
        let result = catch_unwind(AssertUnwindSafe(|| work(context))).unwrap_or_else(|_| {
            Err(Error::backend(
                label.as_str(),
                BackendStatus::ExecutionFailed,
                "compute function panicked",
            ))
        });
        end = clock.now_ns();
        result
    });

    match outcome {
        Ok(()) => {
            let info = profiling.then(|| ProfilingInfo {
                queued,
                submit,
                start,
                end,
                complete: Some(clock.now_ns()),
            });
            if let Some(info) = &info {
                let fields = [("queued", info.queued), ("submit", info.submit), ("start", start), ("end", end)];
                trace!(record = %json_record(&label, &fields), "command profile");
            }
            signal.resolve(info);
        }
        Err(err) => {
            warn!(op = %label, error = %err, "stream command failed");
            signal.fail(err);
        }
    }
    // pins go only after the event is resolved
    drop(work);
}

impl<C: ComputeContext + Clone + 'static> ComputeQueue for StreamQueue<C> {
    fn label(&self) -> &str {
        &self.label
    }

    fn context(&self) -> ContextId {
        self.context.id()
    }

    fn launch_ranges(&self, op: &str, bound: &BoundKernel, grid: &[GridRange], prereqs: &[Event]) -> Result<Event> {
        if validate_launch(self.context.id(), op, bound, grid)? {
            trace!(kernel = bound.kernel_name(), op, "empty grid, nothing to launch");
            return Ok(Event::resolved(op));
        }
        let bound = bound.clone();
        let grid = grid.to_vec();
        let queue = self.label.clone();
        self.enqueue(
            op,
            prereqs,
            Box::new(move |ctx| {
                let span = perf_span!("launch", kernel = bound.kernel_name(), queue = queue.as_str());
                bound.call(ctx, &grid)?;
                record_launch(bound.kernel_name(), grid_points(&grid), span.elapsed_us());
                Ok(())
            }),
        )
    }

    fn enqueue_fill(
        &self,
        op: &str,
        region: &MemoryRegionHandle,
        pattern: &[u8],
        offset: usize,
        length: usize,
        prereqs: &[Event],
    ) -> Result<Event> {
        validate_region(self.context.id(), op, region)?;
        let region = region.clone();
        let pattern = pattern.to_vec();
        self.enqueue(
            op,
            prereqs,
            Box::new(move |_ctx| region.fill_bytes(&pattern, offset, length)),
        )
    }

    fn enqueue_copy(
        &self,
        op: &str,
        from: &MemoryRegionHandle,
        to: &MemoryRegionHandle,
        prereqs: &[Event],
    ) -> Result<Event> {
        validate_region(self.context.id(), op, from)?;
        validate_region(self.context.id(), op, to)?;
        let (from, to) = (from.clone(), to.clone());
        self.enqueue(op, prereqs, Box::new(move |_ctx| from.copy_to(&to)))
    }

    fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    fn finish(&self) -> Result<()> {
        self.shared.flush()?;
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            self.shared.idle.wait(&mut outstanding);
        }
        Ok(())
    }

    fn has_outstanding_work(&self) -> bool {
        *self.shared.outstanding.lock() > 0
    }
}

impl<C: ComputeContext + Clone + 'static> Drop for StreamQueue<C> {
    fn drop(&mut self) {
        if let Err(err) = self.shared.flush() {
            warn!(queue = %self.label, error = %err, "dropping queue with unsubmitted work");
        }
        self.shared.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!(queue = %self.label, "stream worker panicked");
            }
        }
    }
}

/// Context whose queues run host compute functions on worker threads
#[derive(Clone)]
pub struct StreamContext {
    state: Arc<ContextState>,
}

impl Default for StreamContext {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamContext {
    pub fn new() -> Self {
        Self::with_config(ContextConfig::default())
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self {
            state: Arc::new(ContextState::new(BackendKind::Stream, config)),
        }
    }

    pub fn from_env() -> Self {
        Self::with_config(ContextConfig::from_env())
    }

    pub fn allocated_bytes(&self) -> usize {
        self.state.memory.read().allocated_bytes()
    }
}

impl ComputeContext for StreamContext {
    fn id(&self) -> ContextId {
        self.state.id
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Stream
    }

    fn config(&self) -> &ContextConfig {
        &self.state.config
    }

    fn clock(&self) -> &ProfilingClock {
        &self.state.clock
    }

    fn queue(&self, label: &str) -> Result<Arc<dyn ComputeQueue>> {
        Ok(Arc::new(StreamQueue::new(self.clone(), label)?))
    }

    fn allocate(&self, name: &str, element: Arc<ValueDescription>, count: usize) -> Result<MemoryRegionHandle> {
        self.state.memory.write().allocate(name, element, count)
    }

    fn free(&self, region: &MemoryRegionHandle) -> Result<()> {
        self.state.memory.write().free(region)
    }

    fn cache(&self) -> &ContextCache {
        &self.state.cache
    }

    fn kernel(&self, name: &str) -> Result<Arc<Kernel>> {
        cached_kernel(self, name)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Register a stream kernel factory under `name`.
pub fn register_stream_kernel<F>(name: &str, factory: F) -> Result<()>
where
    F: Fn(&dyn ComputeContext) -> Result<Kernel> + Send + Sync + 'static,
{
    register_kernel(BackendKind::Stream, name, factory)
}
