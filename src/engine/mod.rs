//! Connection and concurrency engine for streaming document operations.

mod cluster;
mod connection;
mod correlator;
mod drainer;
mod endpoint;
mod operation;
mod queue;
mod sim;
mod throttle;
mod worker;

pub use cluster::{ClusterOrchestrator, ClusterStats, FeedTarget};
pub use connection::{ConnectionFactory, FeedConnection, RawResponse};
pub use correlator::ResultCorrelator;
pub use endpoint::Endpoint;
pub use operation::{
    CollectingSink, EndpointResult, LineResponseParser, Operation, OperationId, ParsedResults,
    ResponseParser, ResultKind, ResultSink,
};
pub use queue::{OperationQueue, QueueCaller};
pub use sim::{SimScript, SimulatedConnection, SimulatedFactory, WriteOutcome};
pub use throttle::GatewayThrottler;
pub use worker::{ConnectionState, WorkerStatsSnapshot};
