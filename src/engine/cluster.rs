//! Fan-out of one operation stream across endpoints and connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Sender, unbounded};
use serde::Serialize;

use crate::config::FeedParams;
use crate::engine::connection::ConnectionFactory;
use crate::engine::correlator::ResultCorrelator;
use crate::engine::drainer::{ConnectionDrainer, RetiredConnection};
use crate::engine::endpoint::Endpoint;
use crate::engine::operation::{EndpointResult, Operation, ResponseParser, ResultSink};
use crate::engine::queue::{OperationQueue, QueueCaller};
use crate::engine::worker::{ConnectionWorker, WorkerContext, WorkerStats, WorkerStatsSnapshot};
use crate::error::{ClusterError, QueueError};

/// One endpoint and the factory producing its connections.
pub struct FeedTarget {
    pub endpoint: Endpoint,
    pub factory: Arc<dyn ConnectionFactory>,
}

impl FeedTarget {
    pub fn new(endpoint: Endpoint, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self { endpoint, factory }
    }
}

/// Point-in-time view of the cluster. Counters are sampled independently,
/// so totals may be momentarily inconsistent with each other.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub queued: usize,
    pub workers: Vec<WorkerStatsSnapshot>,
}

struct WorkerSlot {
    endpoint: Endpoint,
    stats: Arc<WorkerStats>,
    correlator: ResultCorrelator,
}

/// Owns the shared queue, all worker threads, per-endpoint correlators and
/// the drainer. Operations posted here are fed to exactly one endpoint and
/// resolve with exactly one terminal result each, shutdown included.
pub struct ClusterOrchestrator {
    queue: Arc<OperationQueue>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    slots: Vec<WorkerSlot>,
    correlators: Vec<ResultCorrelator>,
    retired_tx: Option<Sender<RetiredConnection>>,
    drainer: Option<JoinHandle<()>>,
    sink: Arc<dyn ResultSink>,
    /// Endpoint attributed to operations failed at shutdown, before any
    /// worker picked them up.
    shutdown_endpoint: Endpoint,
}

impl ClusterOrchestrator {
    pub fn new(
        params: FeedParams,
        targets: Vec<FeedTarget>,
        parser: Arc<dyn ResponseParser>,
        sink: Arc<dyn ResultSink>,
    ) -> crate::Result<Self> {
        let Some(first) = targets.first() else {
            return Err(ClusterError::NoTargets.into());
        };
        let shutdown_endpoint = first.endpoint.clone();

        let queue = Arc::new(OperationQueue::new(params.queue_capacity));
        let stop = Arc::new(AtomicBool::new(false));
        let (retired_tx, retired_rx) = unbounded();

        let mut workers = Vec::new();
        let mut slots = Vec::new();
        let mut correlators = Vec::new();

        for target in &targets {
            let correlator = ResultCorrelator::new(
                target.endpoint.clone(),
                params.total_timeout,
                Arc::clone(&sink),
            );
            correlators.push(correlator.clone());

            for index in 0..params.connections_per_endpoint {
                let stats = Arc::new(WorkerStats::default());
                let ctx = WorkerContext {
                    endpoint: target.endpoint.clone(),
                    params: params.clone(),
                    queue: Arc::clone(&queue),
                    correlator: correlator.clone(),
                    parser: Arc::clone(&parser),
                    sink: Arc::clone(&sink),
                    factory: Arc::clone(&target.factory),
                    retired_tx: retired_tx.clone(),
                    stop: Arc::clone(&stop),
                    stats: Arc::clone(&stats),
                };
                let name = format!("feed-worker-{}-{index}", target.endpoint.host);
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || ConnectionWorker::new(ctx).run());
                match handle {
                    Ok(handle) => {
                        workers.push(handle);
                        slots.push(WorkerSlot {
                            endpoint: target.endpoint.clone(),
                            stats,
                            correlator: correlator.clone(),
                        });
                    }
                    Err(source) => {
                        abort_startup(&queue, &stop, workers, &correlators);
                        return Err(ClusterError::Spawn { name, source }.into());
                    }
                }
            }
        }

        let drainer = ConnectionDrainer::new(retired_rx, &params);
        let drainer = match thread::Builder::new()
            .name("feed-drainer".into())
            .spawn(move || drainer.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                abort_startup(&queue, &stop, workers, &correlators);
                return Err(ClusterError::Spawn {
                    name: "feed-drainer".into(),
                    source,
                }
                .into());
            }
        };

        tracing::info!(
            endpoints = targets.len(),
            workers = workers.len(),
            "feed cluster started"
        );

        Ok(Self {
            queue,
            stop,
            workers,
            slots,
            correlators,
            retired_tx: Some(retired_tx),
            drainer: Some(drainer),
            sink,
            shutdown_endpoint,
        })
    }

    /// Enqueue one operation. Blocks while the queue is at capacity;
    /// fails with [`QueueError::Closed`] once shutdown has begun.
    pub fn post(&self, op: Operation) -> Result<(), QueueError> {
        self.queue.put(op, QueueCaller::External)
    }

    pub fn stats_snapshot(&self) -> ClusterStats {
        ClusterStats {
            queued: self.queue.len(),
            workers: self
                .slots
                .iter()
                .map(|slot| {
                    slot.stats
                        .snapshot(&slot.endpoint, slot.correlator.inflight_count())
                })
                .collect(),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Graceful shutdown: stop accepting work, let workers finish their
    /// current exchange, wind down the drainer, then fail everything still
    /// queued or in flight so every posted operation resolves exactly once.
    pub fn close(mut self) {
        tracing::info!("closing feed cluster");
        self.queue.close();
        self.stop.store(true, Ordering::Relaxed);

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("feed worker panicked during shutdown");
            }
        }

        // Dropping the sender disconnects the channel, which is the
        // drainer's signal to finish its retirees and exit.
        self.retired_tx.take();
        if let Some(handle) = self.drainer.take()
            && handle.join().is_err()
        {
            tracing::error!("connection drainer panicked during shutdown");
        }

        for op in self.queue.drain_all() {
            self.sink.on_result(EndpointResult::transient(
                op.id,
                self.shutdown_endpoint.clone(),
                "feeder closed before send",
            ));
        }
        for correlator in &self.correlators {
            correlator.fail_pending("feeder closed");
            correlator.stop();
        }
        tracing::info!("feed cluster closed");
    }
}

fn abort_startup(
    queue: &OperationQueue,
    stop: &AtomicBool,
    workers: Vec<JoinHandle<()>>,
    correlators: &[ResultCorrelator],
) {
    stop.store(true, Ordering::Relaxed);
    queue.close();
    for handle in workers {
        let _ = handle.join();
    }
    for correlator in correlators {
        correlator.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::engine::operation::{CollectingSink, LineResponseParser, ResultKind};
    use crate::engine::sim::{SimScript, SimulatedFactory};

    fn params() -> FeedParams {
        FeedParams {
            connections_per_endpoint: 2,
            idle_poll: Duration::from_millis(10),
            reconnect_pause: Duration::from_millis(1),
            drainer_poll_interval: Duration::from_millis(10),
            ..FeedParams::default()
        }
    }

    fn target(host: &str) -> (FeedTarget, Arc<Mutex<SimScript>>) {
        let script = Arc::new(Mutex::new(SimScript::default()));
        let factory = Arc::new(SimulatedFactory::new(Arc::clone(&script)));
        (
            FeedTarget::new(Endpoint::new(host, 8080, false), factory),
            script,
        )
    }

    fn op(id: String) -> Operation {
        Operation::new(id, Bytes::from_static(b"payload"))
    }

    #[test]
    fn empty_target_list_is_rejected() {
        let sink = Arc::new(CollectingSink::new());
        let result =
            ClusterOrchestrator::new(params(), Vec::new(), Arc::new(LineResponseParser), sink);
        assert!(result.is_err());
    }

    #[test]
    fn posted_operations_resolve_exactly_once_through_close() {
        let sink = Arc::new(CollectingSink::new());
        let (target, _script) = target("alpha");
        let cluster = ClusterOrchestrator::new(
            params(),
            vec![target],
            Arc::new(LineResponseParser),
            sink.clone(),
        )
        .unwrap();

        for i in 0..50 {
            cluster.post(op(format!("doc:{i}"))).unwrap();
        }
        cluster.close();

        let results = sink.results();
        assert_eq!(results.len(), 50);
        let ids: HashSet<_> = results.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids.len(), 50, "each id resolves exactly once");
    }

    #[test]
    fn post_after_close_is_rejected() {
        let sink = Arc::new(CollectingSink::new());
        let (target, _script) = target("alpha");
        let cluster =
            ClusterOrchestrator::new(params(), vec![target], Arc::new(LineResponseParser), sink)
                .unwrap();

        let queue = Arc::clone(&cluster.queue);
        cluster.close();
        assert!(queue.is_closed());
        assert_eq!(
            queue.put(op("late".into()), QueueCaller::External),
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn stats_cover_every_worker() {
        let sink = Arc::new(CollectingSink::new());
        let (alpha, _) = target("alpha");
        let (beta, _) = target("beta");
        let cluster = ClusterOrchestrator::new(
            params(),
            vec![alpha, beta],
            Arc::new(LineResponseParser),
            sink.clone(),
        )
        .unwrap();

        for i in 0..20 {
            cluster.post(op(format!("doc:{i}"))).unwrap();
        }
        let stats = cluster.stats_snapshot();
        assert_eq!(stats.workers.len(), 4);

        // Let the workers finish feeding before shutdown so every result
        // is a genuine acknowledgement.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sink.result_count() < 20 {
            assert!(std::time::Instant::now() < deadline, "feeding stalled");
            std::thread::sleep(Duration::from_millis(5));
        }
        cluster.close();

        let results = sink.results();
        assert_eq!(results.len(), 20);
        assert!(results.iter().all(|r| r.kind == ResultKind::Success));
    }
}
