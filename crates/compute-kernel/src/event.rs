//! Completion events.
//!
//! Every enqueue returns an [`Event`]. Synchronous backends return one that
//! is already resolved; asynchronous backends keep the matching
//! [`EventSignal`] and complete it from their worker.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{BackendStatus, Error, Result};

/// Timestamps in nanoseconds since the owning context was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilingInfo {
    pub queued: u64,
    pub submit: u64,
    pub start: u64,
    pub end: u64,
    pub complete: Option<u64>,
}

impl ProfilingInfo {
    pub fn execution_ns(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn queue_delay_ns(&self) -> u64 {
        self.start.saturating_sub(self.queued)
    }
}

/// Monotonic clock anchored at context creation.
#[derive(Debug, Clone, Copy)]
pub struct ProfilingClock {
    origin: Instant,
}

impl Default for ProfilingClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfilingClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

enum Status {
    Pending,
    Resolved,
    Failed(Error),
}

type Continuation = Box<dyn FnOnce(std::result::Result<(), &Error>) + Send>;
type WaitHook = Box<dyn Fn() + Send + Sync>;

struct Inner {
    status: Status,
    profiling: Option<ProfilingInfo>,
    continuations: Vec<Continuation>,
}

struct EventState {
    label: String,
    inner: Mutex<Inner>,
    resolved: Condvar,
    on_wait: Option<WaitHook>,
}

/// Handle to the eventual completion of one unit of work.
#[derive(Clone)]
pub struct Event {
    state: Arc<EventState>,
}

impl Event {
    fn with_status(label: &str, status: Status, profiling: Option<ProfilingInfo>, on_wait: Option<WaitHook>) -> Self {
        Self {
            state: Arc::new(EventState {
                label: label.to_string(),
                inner: Mutex::new(Inner {
                    status,
                    profiling,
                    continuations: Vec::new(),
                }),
                resolved: Condvar::new(),
                on_wait,
            }),
        }
    }

    pub fn resolved(label: &str) -> Self {
        Self::with_status(label, Status::Resolved, None, None)
    }

    pub fn resolved_with(label: &str, profiling: Option<ProfilingInfo>) -> Self {
        Self::with_status(label, Status::Resolved, profiling, None)
    }

    pub fn failed(label: &str, error: Error) -> Self {
        Self::with_status(label, Status::Failed(error), None, None)
    }

    /// A pending event and the signal that completes it.
    pub fn pending(label: &str) -> (Self, EventSignal) {
        Self::pending_inner(label, None)
    }

    /// Like [`Event::pending`], with `on_wait` run before a blocking wait.
    /// Asynchronous queues use it to submit batched work.
    pub fn pending_with_hook(label: &str, on_wait: impl Fn() + Send + Sync + 'static) -> (Self, EventSignal) {
        Self::pending_inner(label, Some(Box::new(on_wait)))
    }

    fn pending_inner(label: &str, on_wait: Option<WaitHook>) -> (Self, EventSignal) {
        let event = Self::with_status(label, Status::Pending, None, on_wait);
        let signal = EventSignal {
            state: Some(event.state.clone()),
        };
        (event, signal)
    }

    pub fn label(&self) -> &str {
        &self.state.label
    }

    /// True once the work finished, successfully or not.
    pub fn is_complete(&self) -> bool {
        !matches!(self.state.inner.lock().status, Status::Pending)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state.inner.lock().status, Status::Resolved)
    }

    /// Block until the work completes, returning its failure if any.
    pub fn wait(&self) -> Result<()> {
        if !self.is_complete() {
            self.run_wait_hook();
        }
        let mut inner = self.state.inner.lock();
        while matches!(inner.status, Status::Pending) {
            self.state.resolved.wait(&mut inner);
        }
        match &inner.status {
            Status::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    fn run_wait_hook(&self) {
        if let Some(hook) = &self.state.on_wait {
            hook();
        }
    }

    /// Run `continuation` after this event resolves and return an event
    /// for the continuation itself.
    ///
    /// Completed events run it inline. A failed event skips the
    /// continuation and passes its failure on to the returned event.
    pub fn then<F>(&self, continuation: F) -> Event
    where
        F: FnOnce() + Send + 'static,
    {
        let label = format!("{} then", self.state.label);
        let mut inner = self.state.inner.lock();
        match &inner.status {
            Status::Resolved => {
                drop(inner);
                continuation();
                Event::resolved(&label)
            }
            Status::Failed(err) => Event::failed(&label, err.clone()),
            Status::Pending => {
                let parent = self.clone();
                let (event, signal) = Event::pending_with_hook(&label, move || parent.run_wait_hook());
                inner.continuations.push(Box::new(move |outcome| match outcome {
                    Ok(()) => match catch_unwind(AssertUnwindSafe(continuation)) {
                        Ok(()) => signal.resolve(None),
                        Err(_) => {
                            let err = Error::backend(
                                signal.label(),
                                BackendStatus::ExecutionFailed,
                                "continuation panicked",
                            );
                            signal.fail(err);
                        }
                    },
                    Err(err) => signal.fail(err.clone()),
                }));
                event
            }
        }
    }

    pub fn profiling_info(&self) -> Option<ProfilingInfo> {
        self.state.inner.lock().profiling
    }

    /// Wait for every event, returning the first failure.
    pub fn wait_all(events: &[Event]) -> Result<()> {
        let mut first_error = None;
        for event in events {
            if let Err(err) = event.wait() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.inner.lock().status {
            Status::Pending => "pending",
            Status::Resolved => "resolved",
            Status::Failed(_) => "failed",
        };
        f.debug_struct("Event")
            .field("label", &self.state.label)
            .field("state", &state)
            .finish()
    }
}

/// Completion side of a pending [`Event`].
///
/// Dropping a signal without completing it fails the event, so waiters
/// never hang on abandoned work.
pub struct EventSignal {
    state: Option<Arc<EventState>>,
}

impl EventSignal {
    pub fn label(&self) -> &str {
        self.state.as_ref().map_or("", |state| state.label.as_str())
    }

    pub fn resolve(mut self, profiling: Option<ProfilingInfo>) {
        self.complete(Status::Resolved, profiling);
    }

    pub fn fail(mut self, error: Error) {
        self.complete(Status::Failed(error), None);
    }

    fn complete(&mut self, status: Status, profiling: Option<ProfilingInfo>) {
        let Some(state) = self.state.take() else {
            return;
        };
        let continuations = {
            let mut inner = state.inner.lock();
            inner.status = status;
            if profiling.is_some() {
                inner.profiling = profiling;
            }
            std::mem::take(&mut inner.continuations)
        };
        state.resolved.notify_all();

        let inner = state.inner.lock();
        let outcome = match &inner.status {
            Status::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        };
        drop(inner);
        for continuation in continuations {
            continuation(outcome.as_ref().map(|_| ()));
        }
    }
}

impl Drop for EventSignal {
    fn drop(&mut self) {
        if self.state.is_some() {
            let label = self.label().to_string();
            self.complete(
                Status::Failed(Error::backend(label, BackendStatus::InvalidEvent, "work was abandoned before completing")),
                None,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_resolved_event_runs_continuation_inline() {
        let event = Event::resolved("launch");
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let next = event.then(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(next.is_resolved());
        assert!(event.profiling_info().is_none());
    }

    #[test]
    fn test_pending_event_defers_continuation() {
        let (event, signal) = Event::pending("launch");
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let next = event.then(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!next.is_complete());

        signal.resolve(Some(ProfilingInfo {
            queued: 1,
            submit: 2,
            start: 3,
            end: 7,
            complete: Some(8),
        }));
        next.wait().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(event.profiling_info().unwrap().execution_ns(), 4);
    }

    #[test]
    fn test_wait_blocks_until_signalled_from_another_thread() {
        let (event, signal) = Event::pending("async");
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signal.resolve(None);
        });
        event.wait().unwrap();
        assert!(event.is_resolved());
        worker.join().unwrap();
    }

    #[test]
    fn test_failure_propagates_through_then() {
        let (event, signal) = Event::pending("launch");
        let next = event.then(|| panic!("must not run"));
        signal.fail(Error::backend("launch", BackendStatus::ExecutionFailed, "boom"));
        assert!(event.wait().is_err());
        let err = next.wait().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_dropped_signal_fails_event() {
        let (event, signal) = Event::pending("abandoned");
        drop(signal);
        let err = event.wait().unwrap_err();
        assert!(matches!(
            err,
            Error::Backend {
                status: BackendStatus::InvalidEvent,
                ..
            }
        ));
    }

    #[test]
    fn test_wait_hook_runs_for_pending_events() {
        let hooks = Arc::new(AtomicUsize::new(0));
        let counter = hooks.clone();
        let (event, signal) = Event::pending_with_hook("batched", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let waiter = {
            let event = event.clone();
            thread::spawn(move || event.wait())
        };
        thread::sleep(Duration::from_millis(10));
        signal.resolve(None);
        waiter.join().unwrap().unwrap();
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        event.wait().unwrap();
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_all_reports_first_failure() {
        let ok = Event::resolved("a");
        let bad = Event::failed("b", Error::backend("b", BackendStatus::Unknown, "x"));
        assert!(Event::wait_all(&[ok.clone()]).is_ok());
        assert!(Event::wait_all(&[ok, bad]).is_err());
    }
}
