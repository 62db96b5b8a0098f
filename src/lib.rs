//! Client-side document feeding engine.
//!
//! Streams document operations to a clustered backend over caller-supplied
//! connections: a bounded shared queue, per-connection worker state
//! machines, exactly-once result correlation with timeouts, adaptive
//! throttling, and TTL-based connection rotation.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod error;
pub mod telemetry;

pub use error::{ClusterError, ConnectionError, Error, QueueError, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main surface at crate root for convenience
pub use crate::config::{FeedParams, ThrottleParams};
pub use crate::engine::{
    ClusterOrchestrator, ClusterStats, CollectingSink, ConnectionFactory, Endpoint, EndpointResult,
    FeedConnection, FeedTarget, LineResponseParser, Operation, OperationId, ParsedResults,
    RawResponse, ResponseParser, ResultKind, ResultSink, SimScript, SimulatedConnection,
    SimulatedFactory, WriteOutcome,
};
