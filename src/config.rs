//! Tuning surface for the feeding engine.
//!
//! Values only; loading cluster definitions from files or discovery is the
//! embedder's concern.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-cluster feeding parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedParams {
    /// Parallel persistent connections per endpoint.
    pub connections_per_endpoint: usize,
    /// Upper bound on operations sent but not yet resolved, per endpoint.
    pub max_inflight_per_endpoint: usize,
    /// Upper bound on accumulated payload bytes per batch.
    pub max_chunk_bytes: usize,
    /// Capacity of the shared pending-operation queue.
    pub queue_capacity: usize,
    /// Maximum age an operation may spend queued before it is evicted
    /// and failed as a queue timeout.
    pub local_queue_timeout: Duration,
    /// Maximum connection age before proactive rotation. Zero disables
    /// rotation.
    pub connection_ttl: Duration,
    /// Server timeout plus client allowance; an in-flight operation with
    /// no response after this long gets a synthetic timeout result.
    pub total_timeout: Duration,
    /// How long an idle worker blocks on the queue each cycle.
    pub idle_poll: Duration,
    /// Pause between reconnect attempts against a dead endpoint.
    pub reconnect_pause: Duration,
    /// Tick interval of the retired-connection drainer.
    pub drainer_poll_interval: Duration,
    pub throttle: ThrottleParams,
}

impl Default for FeedParams {
    fn default() -> Self {
        Self {
            connections_per_endpoint: 4,
            max_inflight_per_endpoint: 1000,
            max_chunk_bytes: 50 * 1024,
            queue_capacity: 4096,
            local_queue_timeout: Duration::from_secs(120),
            connection_ttl: Duration::from_secs(30),
            total_timeout: Duration::from_secs(60),
            idle_poll: Duration::from_millis(100),
            reconnect_pause: Duration::from_millis(100),
            drainer_poll_interval: Duration::from_millis(250),
            throttle: ThrottleParams::default(),
        }
    }
}

impl FeedParams {
    /// Whether TTL-based connection rotation is enabled.
    pub fn rotates(&self) -> bool {
        !self.connection_ttl.is_zero()
    }

    /// Grace period a retired connection is allowed to keep owing results.
    pub fn drain_grace(&self) -> Duration {
        self.connection_ttl + self.local_queue_timeout
    }
}

/// Adaptive backoff under transient-overload signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleParams {
    /// Base increase applied (jittered) per overloaded exchange.
    pub base_step: Duration,
    /// Base decrease applied (jittered) per clean exchange.
    pub decrease_step: Duration,
    /// Cap on the accumulated backoff sleep.
    pub max_sleep: Duration,
}

impl Default for ThrottleParams {
    fn default() -> Self {
        Self {
            base_step: Duration::from_millis(100),
            decrease_step: Duration::from_millis(20),
            max_sleep: Duration::from_secs(3),
        }
    }
}
