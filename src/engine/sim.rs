//! Deterministic in-memory connection for driving the engine in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use uuid::Uuid;

use crate::engine::connection::{
    ConnectionFactory, FeedConnection, RawResponse, next_connection_serial,
};
use crate::engine::operation::{Operation, OperationId};
use crate::error::ConnectionError;

/// Scripted behavior of one simulated write.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    /// Acknowledge every operation in the batch with success.
    Ack,
    /// Accept the batch but answer nothing; held acks are released by a
    /// later `poll`/`drain` on the same connection.
    Hold,
    /// Accept the batch and never answer, not even on poll. Forces the
    /// in-flight timeout to fire.
    Swallow,
    /// Answer every operation with a transient overload status.
    TransientAll(String),
    Transport(String),
    Protocol(String),
}

/// Shared script steering every connection a [`SimulatedFactory`] hands
/// out. Tests mutate the fields directly under the lock; call counters
/// are observable the same way.
#[derive(Debug, Default)]
pub struct SimScript {
    /// Next N `connect` calls fail with a transport error.
    pub fail_connects: usize,
    /// Next N `connect` calls return `Ok(false)`.
    pub refuse_connects: usize,
    /// Every handshake is rejected with an auth error.
    pub auth_reject_all: bool,
    /// Popped per handshake; empty means success.
    pub handshake_errors: VecDeque<ConnectionError>,
    /// Popped per write; empty means [`WriteOutcome::Ack`].
    pub write_outcomes: VecDeque<WriteOutcome>,

    pub connects: usize,
    pub handshakes: usize,
    pub writes: usize,
    pub polls: usize,
}

pub struct SimulatedConnection {
    serial: u64,
    script: Arc<Mutex<SimScript>>,
    session: Option<Uuid>,
    connected_at: Option<Instant>,
    last_poll: Option<Instant>,
    /// Acks accepted but not yet answered (scripted `Hold`).
    held: Vec<OperationId>,
    closed: bool,
}

impl SimulatedConnection {
    pub fn new(script: Arc<Mutex<SimScript>>) -> Self {
        Self {
            serial: next_connection_serial(),
            script,
            session: None,
            connected_at: None,
            last_poll: None,
            held: Vec::new(),
            closed: false,
        }
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session
    }

    fn flush_held(&mut self) -> RawResponse {
        if self.held.is_empty() {
            return RawResponse::empty();
        }
        let mut body = String::new();
        for id in self.held.drain(..) {
            body.push_str("OK ");
            body.push_str(id.as_str());
            body.push('\n');
        }
        RawResponse::new(Bytes::from(body))
    }

    fn script(&self) -> Result<std::sync::MutexGuard<'_, SimScript>, ConnectionError> {
        self.script
            .lock()
            .map_err(|_| ConnectionError::Protocol("simulation script lock poisoned".into()))
    }
}

impl FeedConnection for SimulatedConnection {
    fn connect(&mut self) -> Result<bool, ConnectionError> {
        let mut script = self.script()?;
        script.connects += 1;
        if script.fail_connects > 0 {
            script.fail_connects -= 1;
            return Err(ConnectionError::Transport("connection refused".into()));
        }
        if script.refuse_connects > 0 {
            script.refuse_connects -= 1;
            return Ok(false);
        }
        drop(script);
        self.connected_at = Some(Instant::now());
        Ok(true)
    }

    fn handshake(&mut self) -> Result<(), ConnectionError> {
        if self.connected_at.is_none() {
            return Err(ConnectionError::Protocol("handshake before connect".into()));
        }
        let mut script = self.script()?;
        script.handshakes += 1;
        if script.auth_reject_all {
            return Err(ConnectionError::Auth("401 unauthorized".into()));
        }
        if let Some(err) = script.handshake_errors.pop_front() {
            return Err(err);
        }
        drop(script);
        self.session = Some(Uuid::new_v4());
        Ok(())
    }

    fn write(&mut self, batch: &[Operation]) -> Result<RawResponse, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Transport("connection closed".into()));
        }
        if self.session.is_none() {
            return Err(ConnectionError::Protocol("write before handshake".into()));
        }
        let outcome = {
            let mut script = self.script()?;
            script.writes += 1;
            script.write_outcomes.pop_front().unwrap_or(WriteOutcome::Ack)
        };
        match outcome {
            WriteOutcome::Ack => {
                let mut body = String::new();
                for op in batch {
                    body.push_str("OK ");
                    body.push_str(op.id.as_str());
                    body.push('\n');
                }
                Ok(RawResponse::new(Bytes::from(body)))
            }
            WriteOutcome::Hold => {
                self.held.extend(batch.iter().map(|op| op.id.clone()));
                Ok(RawResponse::empty())
            }
            WriteOutcome::Swallow => Ok(RawResponse::empty()),
            WriteOutcome::TransientAll(message) => {
                let mut body = String::new();
                for op in batch {
                    body.push_str("TRANSIENT ");
                    body.push_str(op.id.as_str());
                    body.push(' ');
                    body.push_str(&message);
                    body.push('\n');
                }
                Ok(RawResponse::new(Bytes::from(body)))
            }
            WriteOutcome::Transport(message) => Err(ConnectionError::Transport(message)),
            WriteOutcome::Protocol(message) => Err(ConnectionError::Protocol(message)),
        }
    }

    fn poll(&mut self) -> Result<RawResponse, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Transport("connection closed".into()));
        }
        self.last_poll = Some(Instant::now());
        if let Ok(mut script) = self.script.lock() {
            script.polls += 1;
        }
        Ok(self.flush_held())
    }

    fn drain(&mut self) -> Result<RawResponse, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Transport("connection closed".into()));
        }
        Ok(self.flush_held())
    }

    fn close(&mut self) {
        self.closed = true;
        self.session = None;
    }

    fn serial(&self) -> u64 {
        self.serial
    }

    fn connection_time(&self) -> Option<Instant> {
        self.connected_at
    }

    fn last_poll_time(&self) -> Option<Instant> {
        self.last_poll
    }
}

/// Hands out connections sharing one script.
pub struct SimulatedFactory {
    script: Arc<Mutex<SimScript>>,
    created: AtomicUsize,
}

impl SimulatedFactory {
    pub fn new(script: Arc<Mutex<SimScript>>) -> Self {
        Self {
            script,
            created: AtomicUsize::new(0),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl ConnectionFactory for SimulatedFactory {
    fn new_connection(&self) -> Box<dyn FeedConnection> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Box::new(SimulatedConnection::new(Arc::clone(&self.script)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: &str) -> Operation {
        Operation::new(id, Bytes::from_static(b"payload"))
    }

    #[test]
    fn lifecycle_guards_are_enforced() {
        let script = Arc::new(Mutex::new(SimScript::default()));
        let mut conn = SimulatedConnection::new(Arc::clone(&script));

        assert!(conn.handshake().is_err(), "handshake before connect");
        assert!(conn.connect().unwrap());
        assert!(conn.write(&[op("a")]).is_err(), "write before handshake");
        conn.handshake().unwrap();
        assert!(conn.session_id().is_some());
        assert!(conn.connection_time().is_some());
    }

    #[test]
    fn scripted_connect_failures_are_consumed_in_order() {
        let script = Arc::new(Mutex::new(SimScript {
            fail_connects: 1,
            refuse_connects: 1,
            ..SimScript::default()
        }));
        let mut conn = SimulatedConnection::new(Arc::clone(&script));

        assert!(conn.connect().is_err());
        assert!(!conn.connect().unwrap());
        assert!(conn.connect().unwrap());
        assert_eq!(script.lock().unwrap().connects, 3);
    }

    #[test]
    fn held_acks_are_released_by_poll() {
        let script = Arc::new(Mutex::new(SimScript::default()));
        script
            .lock()
            .unwrap()
            .write_outcomes
            .push_back(WriteOutcome::Hold);
        let mut conn = SimulatedConnection::new(Arc::clone(&script));
        conn.connect().unwrap();
        conn.handshake().unwrap();

        let response = conn.write(&[op("a"), op("b")]).unwrap();
        assert!(response.is_empty());
        assert!(conn.last_poll_time().is_none());

        let released = conn.poll().unwrap();
        let body = String::from_utf8_lossy(&released.body).to_string();
        assert!(body.contains("OK a"));
        assert!(body.contains("OK b"));
        assert!(conn.last_poll_time().is_some());

        // Held acks flush once.
        assert!(conn.poll().unwrap().is_empty());
    }

    #[test]
    fn factory_counts_connections_and_assigns_serials() {
        let script = Arc::new(Mutex::new(SimScript::default()));
        let factory = SimulatedFactory::new(script);
        let a = factory.new_connection();
        let b = factory.new_connection();
        assert_eq!(factory.created(), 2);
        assert_ne!(a.serial(), b.serial());
    }
}
