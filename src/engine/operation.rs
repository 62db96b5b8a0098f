//! Feed operations, terminal results, and the delivery seams.

use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;

use crate::engine::connection::RawResponse;
use crate::engine::endpoint::Endpoint;
use crate::error::ConnectionError;

/// Caller-assigned unique identity of one document write/update/remove.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One pending document operation.
///
/// Owned by the caller until enqueued, by the queue while pending, and by
/// exactly one worker while in flight. The payload is opaque to this
/// engine; only its size participates in batch accounting.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub payload: Bytes,
    queued_at: Option<Instant>,
}

impl Operation {
    pub fn new(id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            id: OperationId::new(id),
            payload,
            queued_at: None,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    /// Stamped once by the queue on admission.
    pub(crate) fn stamp_queued(&mut self, at: Instant) {
        if self.queued_at.is_none() {
            self.queued_at = Some(at);
        }
    }

    pub fn queued_at(&self) -> Option<Instant> {
        self.queued_at
    }
}

/// Terminal outcome classification for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Success,
    /// Retryable failure signal; also drives throttling.
    TransientError,
    PermanentError,
}

impl ResultKind {
    pub fn is_success(self) -> bool {
        matches!(self, ResultKind::Success)
    }
}

/// The exactly-once terminal outcome of one operation against one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointResult {
    pub id: OperationId,
    pub kind: ResultKind,
    pub message: Option<String>,
    pub endpoint: Endpoint,
}

impl EndpointResult {
    pub fn success(id: OperationId, endpoint: Endpoint) -> Self {
        Self {
            id,
            kind: ResultKind::Success,
            message: None,
            endpoint,
        }
    }

    pub fn transient(id: OperationId, endpoint: Endpoint, message: impl Into<String>) -> Self {
        Self {
            id,
            kind: ResultKind::TransientError,
            message: Some(message.into()),
            endpoint,
        }
    }

    pub fn permanent(id: OperationId, endpoint: Endpoint, message: impl Into<String>) -> Self {
        Self {
            id,
            kind: ResultKind::PermanentError,
            message: Some(message.into()),
            endpoint,
        }
    }
}

/// Where resolved operations and endpoint-wide conditions are delivered.
///
/// Implemented by the operation processor above this engine. `on_result`
/// is invoked exactly once per posted operation; `on_endpoint_error` is a
/// side channel and completes nothing.
pub trait ResultSink: Send + Sync {
    fn on_result(&self, result: EndpointResult);
    fn on_endpoint_error(&self, endpoint: &Endpoint, error: &ConnectionError);
}

/// Sink that records everything it sees. Used throughout the tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    results: Mutex<Vec<EndpointResult>>,
    endpoint_errors: Mutex<Vec<(Endpoint, ConnectionError)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<EndpointResult> {
        self.results.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn result_count(&self) -> usize {
        self.results.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn endpoint_errors(&self) -> Vec<(Endpoint, ConnectionError)> {
        self.endpoint_errors
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

impl ResultSink for CollectingSink {
    fn on_result(&self, result: EndpointResult) {
        if let Ok(mut results) = self.results.lock() {
            results.push(result);
        }
    }

    fn on_endpoint_error(&self, endpoint: &Endpoint, error: &ConnectionError) {
        if let Ok(mut errors) = self.endpoint_errors.lock() {
            errors.push((endpoint.clone(), error.clone()));
        }
    }
}

/// Decoded wire response: zero or more terminal results, plus how many of
/// them reported transient overload (the throttler input).
#[derive(Debug, Default)]
pub struct ParsedResults {
    pub results: Vec<EndpointResult>,
    pub transient_errors: usize,
}

/// Turns one raw response body into terminal results. The concrete wire
/// format lives with the connection implementation, not this engine.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, endpoint: &Endpoint, raw: &RawResponse) -> ParsedResults;
}

/// Line-oriented status parser matching the simulated wire:
/// `OK <id>`, `TRANSIENT <id> <message>`, `PERMANENT <id> <message>`.
/// Unparseable lines are dropped with a log line rather than failing the
/// whole exchange.
#[derive(Debug, Default)]
pub struct LineResponseParser;

impl ResponseParser for LineResponseParser {
    fn parse(&self, endpoint: &Endpoint, raw: &RawResponse) -> ParsedResults {
        let mut parsed = ParsedResults::default();
        let body = String::from_utf8_lossy(&raw.body);

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, ' ');
            let (Some(tag), Some(id)) = (parts.next(), parts.next()) else {
                tracing::debug!(%endpoint, line, "dropping malformed status line");
                continue;
            };
            let id = OperationId::new(id);
            let message = parts.next().unwrap_or("").to_string();
            match tag {
                "OK" => parsed
                    .results
                    .push(EndpointResult::success(id, endpoint.clone())),
                "TRANSIENT" => {
                    parsed.transient_errors += 1;
                    parsed
                        .results
                        .push(EndpointResult::transient(id, endpoint.clone(), message));
                }
                "PERMANENT" => parsed
                    .results
                    .push(EndpointResult::permanent(id, endpoint.clone(), message)),
                _ => {
                    tracing::debug!(%endpoint, line, "dropping malformed status line");
                }
            }
        }

        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("localhost", 8080, false)
    }

    #[test]
    fn operation_stamps_queue_time_once() {
        let mut op = Operation::new("doc:1", Bytes::from_static(b"payload"));
        assert!(op.queued_at().is_none());

        let first = Instant::now();
        op.stamp_queued(first);
        op.stamp_queued(first + std::time::Duration::from_secs(5));
        assert_eq!(op.queued_at(), Some(first));
        assert_eq!(op.size_bytes(), 7);
    }

    #[test]
    fn line_parser_classifies_statuses() {
        let raw = RawResponse::new(Bytes::from_static(
            b"OK doc:1\nTRANSIENT doc:2 server busy\nPERMANENT doc:3 malformed\n",
        ));
        let parsed = LineResponseParser.parse(&endpoint(), &raw);

        assert_eq!(parsed.results.len(), 3);
        assert_eq!(parsed.transient_errors, 1);
        assert_eq!(parsed.results[0].kind, ResultKind::Success);
        assert_eq!(parsed.results[1].kind, ResultKind::TransientError);
        assert_eq!(parsed.results[1].message.as_deref(), Some("server busy"));
        assert_eq!(parsed.results[2].kind, ResultKind::PermanentError);
    }

    #[test]
    fn line_parser_skips_garbage() {
        let raw = RawResponse::new(Bytes::from_static(b"\nWHAT\nOK doc:1\n???? doc:2 x\n"));
        let parsed = LineResponseParser.parse(&endpoint(), &raw);
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.transient_errors, 0);
    }

    #[test]
    fn collecting_sink_records_both_channels() {
        let sink = CollectingSink::new();
        sink.on_result(EndpointResult::success(OperationId::new("a"), endpoint()));
        sink.on_endpoint_error(&endpoint(), &ConnectionError::Auth("401".into()));

        assert_eq!(sink.result_count(), 1);
        assert_eq!(sink.endpoint_errors().len(), 1);
    }
}
