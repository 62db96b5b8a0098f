//! Per-connection feeding state machine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use crossbeam::channel::Sender;
use rand::Rng;
use serde::Serialize;

use crate::config::FeedParams;
use crate::engine::connection::{ConnectionFactory, FeedConnection, RawResponse};
use crate::engine::correlator::ResultCorrelator;
use crate::engine::drainer::RetiredConnection;
use crate::engine::endpoint::Endpoint;
use crate::engine::operation::{EndpointResult, Operation, ResponseParser, ResultSink};
use crate::engine::queue::OperationQueue;
use crate::engine::throttle::GatewayThrottler;
use crate::error::ConnectionError;

/// Protocol position of the worker's current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live transport.
    Disconnected,
    /// Transport open, session not yet synchronized.
    Connected,
    /// Handshake complete; steady-state send/receive.
    SessionSynced,
}

/// Everything one worker shares with the rest of the cluster.
pub(crate) struct WorkerContext {
    pub endpoint: Endpoint,
    pub params: FeedParams,
    pub queue: Arc<OperationQueue>,
    pub correlator: ResultCorrelator,
    pub parser: Arc<dyn ResponseParser>,
    pub sink: Arc<dyn ResultSink>,
    pub factory: Arc<dyn ConnectionFactory>,
    pub retired_tx: Sender<RetiredConnection>,
    pub stop: Arc<AtomicBool>,
    pub stats: Arc<WorkerStats>,
}

/// Independent atomic counters; snapshots are not cross-counter
/// consistent.
#[derive(Debug, Default)]
pub(crate) struct WorkerStats {
    pub documents_sent: AtomicU64,
    pub results_received: AtomicU64,
    pub handshakes_ok: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub transport_errors: AtomicU64,
    pub last_exchange_micros: AtomicU64,
}

impl WorkerStats {
    pub(crate) fn snapshot(&self, endpoint: &Endpoint, pending: usize) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            endpoint: endpoint.to_string(),
            documents_sent: self.documents_sent.load(Ordering::Relaxed),
            results_received: self.results_received.load(Ordering::Relaxed),
            handshakes_ok: self.handshakes_ok.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            last_exchange_micros: self.last_exchange_micros.load(Ordering::Relaxed),
            pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatsSnapshot {
    pub endpoint: String,
    pub documents_sent: u64,
    pub results_received: u64,
    pub handshakes_ok: u64,
    pub protocol_errors: u64,
    pub transport_errors: u64,
    pub last_exchange_micros: u64,
    pub pending: usize,
}

/// Owns one connection and drives it through connect/handshake/feed
/// cycles until stopped. Transport failures reconnect forever; protocol
/// failures re-handshake; an authentication rejection halts feeding on
/// this worker until an operator intervenes.
pub(crate) struct ConnectionWorker {
    ctx: WorkerContext,
    connection: Box<dyn FeedConnection>,
    state: ConnectionState,
    throttler: GatewayThrottler,
    halted: bool,
}

impl ConnectionWorker {
    pub(crate) fn new(ctx: WorkerContext) -> Self {
        let connection = ctx.factory.new_connection();
        let throttler = GatewayThrottler::new(ctx.params.throttle.clone());
        Self {
            ctx,
            connection,
            state: ConnectionState::Disconnected,
            throttler,
            halted: false,
        }
    }

    pub(crate) fn run(mut self) {
        while !self.ctx.stop.load(Ordering::Relaxed) {
            self.step();
            if self.halted {
                thread::sleep(self.ctx.params.idle_poll);
            }
        }
        self.shutdown();
    }

    /// One state-machine cycle. Split out from `run` so tests can drive
    /// the machine deterministically.
    pub(crate) fn step(&mut self) {
        if self.halted {
            self.drain_queue_halted();
            return;
        }
        self.state = match self.state {
            ConnectionState::Disconnected => self.cycle_disconnected(),
            ConnectionState::Connected => self.cycle_connected(),
            ConnectionState::SessionSynced => self.cycle_synced(),
        };
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted
    }

    fn cycle_disconnected(&mut self) -> ConnectionState {
        match self.connection.connect() {
            Ok(true) => {
                tracing::debug!(endpoint = %self.ctx.endpoint, serial = self.connection.serial(), "connected");
                ConnectionState::Connected
            }
            Ok(false) => {
                self.evict_stale_head();
                thread::sleep(self.ctx.params.reconnect_pause);
                ConnectionState::Disconnected
            }
            Err(err) => {
                self.ctx
                    .stats
                    .transport_errors
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(endpoint = %self.ctx.endpoint, "connect failed: {err}");
                self.evict_stale_head();
                thread::sleep(self.ctx.params.reconnect_pause);
                ConnectionState::Disconnected
            }
        }
    }

    fn cycle_connected(&mut self) -> ConnectionState {
        if self.is_stale() {
            return self.rotate();
        }
        match self.connection.handshake() {
            Ok(()) => {
                self.ctx.stats.handshakes_ok.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(endpoint = %self.ctx.endpoint, "session synchronized");
                ConnectionState::SessionSynced
            }
            Err(err) if err.is_auth() => {
                tracing::error!(
                    endpoint = %self.ctx.endpoint,
                    "handshake rejected, halting feeding on this endpoint: {err}"
                );
                self.ctx.sink.on_endpoint_error(&self.ctx.endpoint, &err);
                self.halted = true;
                ConnectionState::Connected
            }
            Err(err) if err.is_transport() => {
                self.ctx
                    .stats
                    .transport_errors
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(endpoint = %self.ctx.endpoint, "handshake transport failure: {err}");
                self.ctx.sink.on_endpoint_error(&self.ctx.endpoint, &err);
                self.evict_stale_head();
                self.replace_connection();
                ConnectionState::Disconnected
            }
            Err(err) => {
                self.ctx
                    .stats
                    .protocol_errors
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(endpoint = %self.ctx.endpoint, "handshake failed: {err}");
                self.ctx.sink.on_endpoint_error(&self.ctx.endpoint, &err);
                self.evict_stale_head();
                thread::sleep(self.ctx.params.reconnect_pause);
                ConnectionState::Connected
            }
        }
    }

    fn cycle_synced(&mut self) -> ConnectionState {
        if self.is_stale() {
            return self.rotate();
        }

        let budget = jittered(self.ctx.params.max_inflight_per_endpoint)
            .saturating_sub(self.ctx.correlator.inflight_count());
        let batch = if budget == 0 {
            // In-flight window is full; give the backend a beat, then
            // collect results below.
            thread::sleep(self.ctx.params.idle_poll);
            Vec::new()
        } else {
            self.pull_batch(budget)
        };

        if batch.is_empty() {
            if self.ctx.correlator.has_inflight(self.connection.serial()) {
                return match self.connection.poll() {
                    Ok(raw) => {
                        self.process_response(&raw);
                        ConnectionState::SessionSynced
                    }
                    Err(err) => self.handle_exchange_error(err, &[]),
                };
            }
            // Nothing to send, nothing pending: no network call this cycle.
            return ConnectionState::SessionSynced;
        }

        for op in &batch {
            self.ctx
                .correlator
                .operation_sent(op.id.clone(), self.connection.serial());
        }

        let started = Instant::now();
        match self.connection.write(&batch) {
            Ok(raw) => {
                self.ctx
                    .stats
                    .documents_sent
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.ctx
                    .stats
                    .last_exchange_micros
                    .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                let transient_errors = self.process_response(&raw);
                self.throttler.on_exchange(transient_errors);
                self.throttler.apply_backoff();
                ConnectionState::SessionSynced
            }
            Err(err) => self.handle_exchange_error(err, &batch),
        }
    }

    fn handle_exchange_error(
        &mut self,
        err: ConnectionError,
        batch: &[Operation],
    ) -> ConnectionState {
        if err.is_auth() {
            tracing::error!(
                endpoint = %self.ctx.endpoint,
                "exchange rejected, halting feeding on this endpoint: {err}"
            );
            for op in batch {
                self.ctx.correlator.fail_operation(EndpointResult::permanent(
                    op.id.clone(),
                    self.ctx.endpoint.clone(),
                    format!("exchange failed: {err}"),
                ));
            }
            self.ctx.sink.on_endpoint_error(&self.ctx.endpoint, &err);
            self.halted = true;
            return ConnectionState::Connected;
        }

        for op in batch {
            self.ctx.correlator.fail_operation(EndpointResult::transient(
                op.id.clone(),
                self.ctx.endpoint.clone(),
                format!("exchange failed: {err}"),
            ));
        }

        if err.is_transport() {
            self.ctx
                .stats
                .transport_errors
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(endpoint = %self.ctx.endpoint, "transport failure, reconnecting: {err}");
            self.replace_connection();
            ConnectionState::Disconnected
        } else {
            self.ctx
                .stats
                .protocol_errors
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(endpoint = %self.ctx.endpoint, "protocol failure, re-handshaking: {err}");
            ConnectionState::Connected
        }
    }

    /// Pull up to `budget` operations, the first via a blocking poll so an
    /// idle worker parks instead of spinning. Accumulated bytes are capped
    /// by a per-cycle jittered chunk limit.
    fn pull_batch(&mut self, budget: usize) -> Vec<Operation> {
        let byte_limit = jittered(self.ctx.params.max_chunk_bytes);
        let mut batch = Vec::new();
        let mut bytes = 0usize;

        let Some(first) = self.ctx.queue.poll_timeout(self.ctx.params.idle_poll) else {
            return batch;
        };
        bytes += first.size_bytes();
        batch.push(first);

        while batch.len() < budget && bytes < byte_limit {
            let Some(op) = self.ctx.queue.poll_now() else {
                break;
            };
            bytes += op.size_bytes();
            batch.push(op);
        }
        batch
    }

    fn process_response(&mut self, raw: &RawResponse) -> usize {
        let parsed = self.ctx.parser.parse(&self.ctx.endpoint, raw);
        self.ctx
            .stats
            .results_received
            .fetch_add(parsed.results.len() as u64, Ordering::Relaxed);
        for result in parsed.results {
            self.ctx.correlator.result_received(result);
        }
        parsed.transient_errors
    }

    /// Hand the aged-out connection to the drainer and start over with a
    /// fresh one. In-flight results on the old connection keep correlating
    /// while the drainer shepherds it.
    fn rotate(&mut self) -> ConnectionState {
        let fresh = self.ctx.factory.new_connection();
        let old = std::mem::replace(&mut self.connection, fresh);
        tracing::info!(
            endpoint = %self.ctx.endpoint,
            serial = old.serial(),
            "rotating connection past its ttl"
        );
        let retired = RetiredConnection {
            connection: old,
            retired_at: Instant::now(),
            endpoint: self.ctx.endpoint.clone(),
            correlator: self.ctx.correlator.clone(),
            parser: Arc::clone(&self.ctx.parser),
        };
        if let Err(send_err) = self.ctx.retired_tx.send(retired) {
            // Drainer already gone (shutdown); close now, anything still
            // in flight resolves through the correlator's timeout.
            let mut orphan = send_err.into_inner();
            orphan.connection.close();
        }
        ConnectionState::Disconnected
    }

    fn is_stale(&self) -> bool {
        self.ctx.params.rotates()
            && self
                .connection
                .connection_time()
                .is_some_and(|at| at.elapsed() > self.ctx.params.connection_ttl)
    }

    fn replace_connection(&mut self) {
        self.connection.close();
        self.connection = self.ctx.factory.new_connection();
    }

    /// Operations waiting longer than the local queue timeout are failed
    /// while the endpoint is unreachable, so callers are not kept waiting
    /// indefinitely for a dead endpoint.
    fn evict_stale_head(&mut self) {
        while let Some(op) = self
            .ctx
            .queue
            .evict_stale(self.ctx.params.local_queue_timeout)
        {
            self.ctx.sink.on_result(EndpointResult::transient(
                op.id,
                self.ctx.endpoint.clone(),
                "timed out in send queue",
            ));
        }
    }

    fn drain_queue_halted(&mut self) {
        while let Some(op) = self.ctx.queue.poll_now() {
            self.ctx.sink.on_result(EndpointResult::permanent(
                op.id,
                self.ctx.endpoint.clone(),
                "endpoint authentication failed; feeding halted",
            ));
        }
    }

    fn shutdown(mut self) {
        if self.state == ConnectionState::SessionSynced {
            // Best-effort: collect whatever the server already computed.
            match self.connection.drain() {
                Ok(raw) => {
                    self.process_response(&raw);
                }
                Err(err) => {
                    tracing::debug!(endpoint = %self.ctx.endpoint, "final drain failed: {err}");
                }
            }
        }
        self.connection.close();
        tracing::debug!(endpoint = %self.ctx.endpoint, "worker stopped");
    }
}

fn jittered(limit: usize) -> usize {
    let factor = rand::rng().random_range(0.75..1.25);
    (((limit as f64) * factor).round() as usize).max(1)
}
