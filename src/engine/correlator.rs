//! In-flight operation bookkeeping and timeout enforcement, per endpoint.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::endpoint::Endpoint;
use crate::engine::operation::{EndpointResult, OperationId, ResultSink};

/// Maps operation ids to their pending timeout and owning connection from
/// the moment a batch is written until a terminal result arrives or the
/// timeout fires. Every removal path funnels through the same map, which
/// is what makes delivery exactly-once per id regardless of the race
/// between network response and timeout.
///
/// Cheap to clone; all clones share state. A dedicated reaper thread
/// fires synthetic timeout results for overdue entries.
#[derive(Clone)]
pub struct ResultCorrelator {
    inner: Arc<CorrelatorInner>,
}

struct CorrelatorInner {
    endpoint: Endpoint,
    total_timeout: Duration,
    sink: Arc<dyn ResultSink>,
    state: Mutex<CorrelatorState>,
    wake: Condvar,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

struct CorrelatorState {
    inflight: HashMap<OperationId, Inflight>,
    deadlines: BinaryHeap<Reverse<DeadlineEntry>>,
    next_generation: u64,
    shutdown: bool,
}

struct Inflight {
    connection_serial: u64,
    generation: u64,
}

/// Heap entry; a stale entry (generation no longer in the map) is skipped
/// when popped rather than removed eagerly.
#[derive(Debug, PartialEq, Eq)]
struct DeadlineEntry {
    deadline: Instant,
    generation: u64,
    id: OperationId,
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl ResultCorrelator {
    pub fn new(endpoint: Endpoint, total_timeout: Duration, sink: Arc<dyn ResultSink>) -> Self {
        let inner = Arc::new(CorrelatorInner {
            endpoint: endpoint.clone(),
            total_timeout,
            sink,
            state: Mutex::new(CorrelatorState {
                inflight: HashMap::new(),
                deadlines: BinaryHeap::new(),
                next_generation: 1,
                shutdown: false,
            }),
            wake: Condvar::new(),
            reaper: Mutex::new(None),
        });

        let reaper_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(format!("feed-timeout-{}", endpoint.host))
            .spawn(move || run_reaper(&reaper_inner));
        match handle {
            Ok(handle) => {
                if let Ok(mut slot) = inner.reaper.lock() {
                    *slot = Some(handle);
                }
            }
            Err(err) => {
                tracing::error!(%endpoint, "failed to spawn timeout reaper: {err}");
            }
        }

        Self { inner }
    }

    /// Register an operation handed to `write` on the given connection.
    /// Must run before the write returns so the timeout clock covers the
    /// whole exchange.
    pub fn operation_sent(&self, id: OperationId, connection_serial: u64) {
        let deadline = Instant::now() + self.inner.total_timeout;
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        let generation = state.next_generation;
        state.next_generation += 1;
        if state
            .inflight
            .insert(
                id.clone(),
                Inflight {
                    connection_serial,
                    generation,
                },
            )
            .is_some()
        {
            tracing::warn!(%id, "operation re-registered while in flight");
        }
        state.deadlines.push(Reverse(DeadlineEntry {
            deadline,
            generation,
            id,
        }));
        self.inner.wake.notify_all();
    }

    /// Deliver a terminal result from the wire. A missing entry (already
    /// timed out, or resolved through another path) is logged and ignored.
    pub fn result_received(&self, result: EndpointResult) {
        self.resolve(result);
    }

    /// Fail one in-flight operation locally (batch-level write failure).
    pub fn fail_operation(&self, result: EndpointResult) {
        self.resolve(result);
    }

    /// Fail everything still in flight. Used on shutdown and fatal
    /// reconnects.
    pub fn fail_pending(&self, reason: &str) {
        let drained: Vec<OperationId> = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            state.deadlines.clear();
            state.inflight.drain().map(|(id, _)| id).collect()
        };
        for id in drained {
            self.inner.sink.on_result(EndpointResult::transient(
                id,
                self.inner.endpoint.clone(),
                reason,
            ));
        }
    }

    /// Whether a given connection still owes results. Drives the drainer's
    /// keep-or-close decision for retired connections.
    pub fn has_inflight(&self, connection_serial: u64) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| {
                state
                    .inflight
                    .values()
                    .any(|entry| entry.connection_serial == connection_serial)
            })
            .unwrap_or(false)
    }

    pub fn inflight_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .map(|state| state.inflight.len())
            .unwrap_or(0)
    }

    /// Stop the reaper thread. Pending entries are left untouched; call
    /// `fail_pending` first during shutdown.
    pub fn stop(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.shutdown = true;
        }
        self.inner.wake.notify_all();
        let handle = self.inner.reaper.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn resolve(&self, result: EndpointResult) {
        let removed = self
            .inner
            .state
            .lock()
            .map(|mut state| state.inflight.remove(&result.id).is_some())
            .unwrap_or(false);
        if removed {
            self.inner.sink.on_result(result);
        } else {
            tracing::debug!(id = %result.id, "dropping result for unknown or already-resolved operation");
        }
    }
}

fn run_reaper(inner: &CorrelatorInner) {
    let Ok(mut state) = inner.state.lock() else {
        return;
    };
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        loop {
            let head_due = matches!(
                state.deadlines.peek(),
                Some(Reverse(head)) if head.deadline <= now
            );
            if !head_due {
                break;
            }
            let Some(Reverse(entry)) = state.deadlines.pop() else {
                break;
            };
            let live = state
                .inflight
                .get(&entry.id)
                .is_some_and(|inflight| inflight.generation == entry.generation);
            if live {
                state.inflight.remove(&entry.id);
                due.push(entry.id);
            }
        }

        if !due.is_empty() {
            drop(state);
            for id in due {
                tracing::debug!(%id, endpoint = %inner.endpoint, "operation timed out");
                inner.sink.on_result(EndpointResult::transient(
                    id,
                    inner.endpoint.clone(),
                    format!("no response within {:?}", inner.total_timeout),
                ));
            }
            state = match inner.state.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            continue;
        }

        let next_deadline = state.deadlines.peek().map(|Reverse(head)| head.deadline);
        state = match next_deadline {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match inner.wake.wait_timeout(state, wait) {
                    Ok((guard, _)) => guard,
                    Err(_) => return,
                }
            }
            None => match inner.wake.wait(state) {
                Ok(guard) => guard,
                Err(_) => return,
            },
        };
    }
}
