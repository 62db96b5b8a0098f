//! The session contract one worker drives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;

use crate::engine::operation::Operation;
use crate::error::ConnectionError;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection serial. The correlator keys
/// in-flight bookkeeping on serials so it never has to share the
/// connection object itself.
pub(crate) fn next_connection_serial() -> u64 {
    NEXT_SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// Opaque response body of one exchange, handed to the response parser.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(body: Bytes) -> Self {
        Self { body }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// One physical session to one endpoint.
///
/// Wire-level concerns (framing, compression, authentication headers) live
/// behind this trait; the engine sees only the session lifecycle. A
/// connection is written to by the single worker that owns it. After
/// rotation, ownership moves wholesale to the drainer, which only ever
/// calls `poll`/`drain`/`close`. A closed connection is discarded, never
/// reused.
pub trait FeedConnection: Send {
    /// Open the transport. `Ok(false)` means a clean refusal (retry later).
    fn connect(&mut self) -> Result<bool, ConnectionError>;

    /// Synchronize the protocol session on an open transport.
    fn handshake(&mut self) -> Result<(), ConnectionError>;

    /// Send a batch; the returned body may acknowledge any subset of
    /// operations already in flight on this connection.
    fn write(&mut self, batch: &[Operation]) -> Result<RawResponse, ConnectionError>;

    /// Fetch results the server has finished without sending new work.
    fn poll(&mut self) -> Result<RawResponse, ConnectionError>;

    /// Final best-effort result fetch before close.
    fn drain(&mut self) -> Result<RawResponse, ConnectionError>;

    fn close(&mut self);

    /// Process-unique identity of this connection instance.
    fn serial(&self) -> u64;

    /// Set on successful `connect`; `None` means never connected. Drives
    /// TTL staleness checks.
    fn connection_time(&self) -> Option<Instant>;

    /// Set on each `poll`; drives the drainer's backoff schedule.
    fn last_poll_time(&self) -> Option<Instant>;
}

/// Produces fresh connections for one endpoint. Supplied by the embedder
/// for real wires; the crate ships a simulated factory for tests.
pub trait ConnectionFactory: Send + Sync {
    fn new_connection(&self) -> Box<dyn FeedConnection>;
}
