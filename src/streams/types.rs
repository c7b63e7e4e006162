//! Shared data types for the stream store.

use super::producer::ProducerState;

/// One stored message: raw framed bytes, the offset it was assigned, and the
/// wall-clock time it was appended.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub data: Vec<u8>,
    pub offset: String,
    pub timestamp_ms: i64,
}

/// Who closed a stream, for idempotent-close-on-replay detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedBy {
    pub producer_id: String,
    pub epoch: u64,
    pub seq: u64,
}

/// A single append-only log, owned exclusively by [`super::store::StreamStore`].
#[derive(Debug, Clone)]
pub struct Stream {
    pub path: String,
    pub content_type: String,
    pub messages: Vec<StreamMessage>,
    pub current_offset: String,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at_ms: i64,
    pub closed: bool,
    pub closed_by: Option<ClosedBy>,
    pub last_seq: Option<u64>,
    pub producers: std::collections::HashMap<String, ProducerState>,
    /// Offset of the newest message evicted so far under retention, or
    /// `None` if nothing has ever been evicted. Reads at or before this
    /// offset can no longer be satisfied.
    pub floor_offset: Option<String>,
}

impl Stream {
    pub fn is_json(&self) -> bool {
        super::framing::is_json_content_type(&self.content_type)
    }

    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        if let Some(exp) = self.expires_at {
            return now >= exp;
        }
        if let Some(ttl) = self.ttl_seconds {
            let created = chrono::DateTime::from_timestamp_millis(self.created_at_ms)
                .unwrap_or(chrono::DateTime::UNIX_EPOCH);
            return now >= created + chrono::Duration::seconds(ttl as i64);
        }
        false
    }
}

/// Configuration supplied to [`super::store::StreamStore::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub content_type: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub initial_data: Option<Vec<u8>>,
    pub closed: bool,
}

/// Producer coordination headers for an append, all-or-none.
#[derive(Debug, Clone, Default)]
pub struct ProducerHeaders {
    pub producer_id: String,
    pub epoch: u64,
    pub seq: u64,
}

/// Options supplied to [`super::store::StreamStore::append`].
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    pub content_type: Option<String>,
    pub stream_seq: Option<u64>,
    pub producer: Option<ProducerHeaders>,
    pub close: bool,
}

/// Result of [`super::store::StreamStore::append`] on success.
#[derive(Debug, Clone)]
pub struct AppendResult {
    pub next_offset: String,
    pub idempotent_replay: bool,
    pub stream_closed: bool,
}

/// Result of [`super::store::StreamStore::read`].
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub messages: Vec<StreamMessage>,
    pub next_offset: String,
    pub up_to_date: bool,
    pub stream_closed: bool,
}

/// Result of [`super::store::StreamStore::wait_for_messages`].
#[derive(Debug, Clone)]
pub struct WaitResult {
    pub messages: Vec<StreamMessage>,
    pub next_offset: String,
    pub timed_out: bool,
    pub stream_closed: bool,
}
