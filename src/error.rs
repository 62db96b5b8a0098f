use thiserror::Error;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Failure of a single exchange on one connection.
///
/// The classification drives the worker state machine: transport failures
/// always reconnect, protocol failures re-handshake, authentication
/// failures halt feeding on the endpoint until an operator intervenes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("protocol failure: {0}")]
    Protocol(String),

    #[error("authentication rejected: {0}")]
    Auth(String),
}

impl ConnectionError {
    pub fn transience(&self) -> Transience {
        match self {
            ConnectionError::Transport(_) | ConnectionError::Protocol(_) => Transience::Retryable,
            ConnectionError::Auth(_) => Transience::Permanent,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ConnectionError::Auth(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ConnectionError::Transport(_))
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        ConnectionError::Transport(err.to_string())
    }
}

/// Failure to enqueue a pending operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("operation queue is closed")]
    Closed,

    #[error("operation queue lock poisoned")]
    LockPoisoned,
}

/// Failure to assemble or start a feeding cluster.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("no feed targets configured")]
    NoTargets,

    #[error("failed to spawn {name} thread")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Crate-level convenience error.
///
/// Thin wrapper over the subsystem errors; per-operation failures never
/// travel this path, they arrive asynchronously as `EndpointResult`s.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Connection(e) => e.transience(),
            Error::Queue(QueueError::Closed) => Transience::Permanent,
            Error::Queue(QueueError::LockPoisoned) => Transience::Permanent,
            Error::Cluster(ClusterError::NoTargets) => Transience::Permanent,
            Error::Cluster(ClusterError::Spawn { .. }) => Transience::Retryable,
        }
    }
}
