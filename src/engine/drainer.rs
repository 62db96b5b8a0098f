//! Shepherds rotated-out connections until their in-flight results land.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::config::FeedParams;
use crate::engine::connection::{FeedConnection, RawResponse};
use crate::engine::correlator::ResultCorrelator;
use crate::engine::endpoint::Endpoint;
use crate::engine::operation::ResponseParser;

/// One connection handed off by a worker at rotation, together with
/// everything needed to keep correlating its outstanding results.
pub(crate) struct RetiredConnection {
    pub connection: Box<dyn FeedConnection>,
    pub retired_at: Instant,
    pub endpoint: Endpoint,
    pub correlator: ResultCorrelator,
    pub parser: Arc<dyn ResponseParser>,
}

/// Single thread tending every retired connection of a cluster.
///
/// A retiree is closed as soon as the correlator owes it nothing, force-
/// closed once its grace period runs out, and otherwise polled on a
/// doubling schedule so a mostly-drained connection costs almost nothing.
/// Channel disconnect is the shutdown signal.
pub(crate) struct ConnectionDrainer {
    rx: Receiver<RetiredConnection>,
    poll_interval: Duration,
    grace: Duration,
}

impl ConnectionDrainer {
    pub(crate) fn new(rx: Receiver<RetiredConnection>, params: &FeedParams) -> Self {
        Self {
            rx,
            poll_interval: params.drainer_poll_interval,
            grace: params.drain_grace(),
        }
    }

    pub(crate) fn run(self) {
        let mut retirees: Vec<Tracked> = Vec::new();
        loop {
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(retired) => {
                    retirees.push(Tracked::new(retired, self.poll_interval));
                    while let Ok(more) = self.rx.try_recv() {
                        retirees.push(Tracked::new(more, self.poll_interval));
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            retirees.retain_mut(|tracked| tracked.tend(self.grace));
        }

        for tracked in retirees {
            tracked.finish();
        }
        tracing::debug!("connection drainer stopped");
    }
}

struct Tracked {
    retired: RetiredConnection,
    next_poll: Instant,
    poll_gap: Duration,
}

impl Tracked {
    fn new(retired: RetiredConnection, base_gap: Duration) -> Self {
        Self {
            retired,
            next_poll: Instant::now(),
            poll_gap: base_gap,
        }
    }

    /// One tending pass. Returns `false` once the connection is closed and
    /// can be dropped.
    fn tend(&mut self, grace: Duration) -> bool {
        let serial = self.retired.connection.serial();
        if !self.retired.correlator.has_inflight(serial) {
            tracing::debug!(endpoint = %self.retired.endpoint, serial, "retired connection fully drained");
            self.retired.connection.close();
            return false;
        }
        if self.retired.retired_at.elapsed() > grace {
            tracing::warn!(
                endpoint = %self.retired.endpoint,
                serial,
                "closing retired connection with results still pending"
            );
            // One last chance to harvest results; the correlator timeout
            // resolves whatever is still missing afterwards.
            self.final_poll();
            self.retired.connection.close();
            return false;
        }
        if Instant::now() >= self.next_poll {
            match self.retired.connection.poll() {
                Ok(raw) => {
                    self.process(&raw);
                    self.poll_gap = self.poll_gap.saturating_mul(2);
                    self.next_poll = Instant::now() + self.poll_gap;
                }
                Err(err) => {
                    tracing::warn!(
                        endpoint = %self.retired.endpoint,
                        serial,
                        "poll of retired connection failed, closing: {err}"
                    );
                    self.retired.connection.close();
                    return false;
                }
            }
        }
        true
    }

    fn final_poll(&mut self) {
        if let Ok(raw) = self.retired.connection.poll() {
            self.process(&raw);
        }
    }

    fn process(&mut self, raw: &RawResponse) {
        let parsed = self.retired.parser.parse(&self.retired.endpoint, raw);
        for result in parsed.results {
            self.retired.correlator.result_received(result);
        }
    }

    fn finish(mut self) {
        if self
            .retired
            .correlator
            .has_inflight(self.retired.connection.serial())
        {
            self.final_poll();
        }
        self.retired.connection.close();
    }
}
