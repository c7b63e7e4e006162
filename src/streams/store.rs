//! In-memory stream storage (component C) with long-poll/SSE waiter support
//! (component D).
//!
//! Grounded on the reference `StreamStore` (moneymq's `crates/stream/src/store.rs`):
//! the same `RwLock<HashMap<path, Stream>>` shape and idempotent-create /
//! expiry-on-access behavior, extended with closed-stream tracking, the
//! producer ledger (component E), and per-path waiter notification for
//! long-poll/SSE instead of a single shared broadcast channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Notify, watch};
use tracing::{debug, info};

use super::framing::{self, DEFAULT_CONTENT_TYPE};
use super::offset::{self, Offset};
use super::producer::{self, ProducerOutcome};
use super::types::{
    AppendOptions, AppendResult, ClosedBy, CreateOptions, ReadResult, Stream, StreamMessage,
    WaitResult,
};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("stream not found: {0}")]
    NotFound(String),
    #[error("stream already exists with a different configuration")]
    StreamConflict,
    #[error("content-type mismatch: expected {expected}, got {actual}")]
    ContentTypeMismatch { expected: String, actual: String },
    #[error("sequence conflict: {0}")]
    SequenceConflict(String),
    #[error("invalid offset: {0}")]
    InvalidOffset(String),
    #[error("empty body not allowed")]
    EmptyBody,
    #[error("cannot specify both Stream-TTL and Stream-Expires-At")]
    TtlConflict,
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),
    #[error("empty JSON arrays are not allowed on append")]
    EmptyArrayNotAllowed,
    #[error("stream is closed")]
    StreamClosed,
    #[error("offset {0} is before the retention window")]
    OffsetExpired(String),
}

/// In-memory store of every live stream, plus the waiter-wakeup mechanism
/// long-poll and SSE readers park on.
pub struct StreamStore {
    streams: RwLock<HashMap<String, Stream>>,
    /// One notifier per path with at least one waiter registered; created
    /// lazily and left in place (cheap, and avoids a race between a waiter
    /// subscribing and an append firing before it starts listening).
    notifiers: DashMap<String, Arc<Notify>>,
    shutdown: watch::Receiver<bool>,
    /// Maximum messages retained per stream before the oldest are evicted.
    /// Zero disables retention entirely.
    max_retained_messages: usize,
}

impl StreamStore {
    pub fn new(shutdown: watch::Receiver<bool>) -> Arc<Self> {
        Self::with_retention(shutdown, 0)
    }

    pub fn with_retention(shutdown: watch::Receiver<bool>, max_retained_messages: usize) -> Arc<Self> {
        Arc::new(Self {
            streams: RwLock::new(HashMap::new()),
            notifiers: DashMap::new(),
            shutdown,
            max_retained_messages,
        })
    }

    fn notifier(&self, path: &str) -> Arc<Notify> {
        self.notifiers.entry(path.to_string()).or_insert_with(|| Arc::new(Notify::new())).clone()
    }

    fn wake(&self, path: &str) {
        if let Some(n) = self.notifiers.get(path) {
            n.notify_waiters();
        }
    }

    /// Expiry-aware existence check; deletes the stream on access if expired.
    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn get(&self, path: &str) -> Option<Stream> {
        let now = Utc::now();
        {
            let streams = self.streams.read();
            if let Some(s) = streams.get(path) {
                if !s.is_expired(now) {
                    return Some(s.clone());
                }
            } else {
                return None;
            }
        }
        // Expired: upgrade to a write lock and remove it.
        let mut streams = self.streams.write();
        if let Some(s) = streams.get(path) {
            if s.is_expired(now) {
                streams.remove(path);
                drop(streams);
                info!(path = %path, "Stream expired, removed on access");
                self.wake(path);
            }
        }
        None
    }

    /// Create (or idempotently match) a stream.
    pub fn create(&self, path: &str, opts: CreateOptions) -> Result<(Stream, bool), StoreError> {
        if opts.ttl_seconds.is_some() && opts.expires_at.is_some() {
            return Err(StoreError::TtlConflict);
        }

        let normalized_ct = opts
            .content_type
            .as_deref()
            .map(framing::normalize_content_type)
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        // Drop expired entries first so re-creation after expiry is a clean create.
        let _ = self.get(path);

        {
            let streams = self.streams.read();
            if let Some(existing) = streams.get(path) {
                let matches = existing.content_type == normalized_ct
                    && existing.ttl_seconds == opts.ttl_seconds
                    && existing.expires_at == opts.expires_at
                    && existing.closed == opts.closed;
                if matches {
                    return Ok((existing.clone(), false));
                }
                return Err(StoreError::StreamConflict);
            }
        }

        let now = Utc::now();
        let mut stream = Stream {
            path: path.to_string(),
            content_type: normalized_ct,
            messages: Vec::new(),
            current_offset: Offset::initial().render(),
            ttl_seconds: opts.ttl_seconds,
            expires_at: opts.expires_at,
            created_at_ms: now.timestamp_millis(),
            closed: opts.closed,
            closed_by: None,
            last_seq: None,
            producers: HashMap::new(),
            floor_offset: None,
        };

        if let Some(data) = opts.initial_data {
            if !data.is_empty() {
                let is_json = stream.is_json();
                let parts = framing::split_append_body(is_json, data, true)?;
                append_parts(&mut stream, parts, now.timestamp_millis());
            }
        }

        self.streams.write().insert(path.to_string(), stream.clone());
        info!(path = %path, content_type = %stream.content_type, "Created stream");
        Ok((stream, true))
    }

    /// Remove a stream, resolving every pending waiter for it with an empty
    /// result. Idempotent: returns `true` only if something was actually
    /// removed (the HTTP layer maps both cases to 204 per DESIGN.md).
    pub fn delete(&self, path: &str) -> bool {
        let removed = self.streams.write().remove(path).is_some();
        if removed {
            info!(path = %path, "Deleted stream");
        }
        self.wake(path);
        removed
    }

    /// Append data to a stream. See component E (producer.rs) for the
    /// idempotency-ledger rules and §4.5 for lock/ordering discipline.
    pub fn append(
        &self,
        path: &str,
        data: Vec<u8>,
        opts: AppendOptions,
    ) -> Result<AppendResult, StoreError> {
        if data.is_empty() && opts.producer.is_none() {
            return Err(StoreError::EmptyBody);
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut streams = self.streams.write();
        let stream = streams.get_mut(path).ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        if let Some(ct) = &opts.content_type {
            let normalized = framing::normalize_content_type(ct);
            if normalized != stream.content_type {
                return Err(StoreError::ContentTypeMismatch {
                    expected: stream.content_type.clone(),
                    actual: normalized,
                });
            }
        }

        // Producer ledger validation runs before Stream-Seq so a duplicate
        // retry carrying both headers returns the dedup path, not a 409.
        let mut producer_commit: Option<(String, u64, u64)> = None;
        if let Some(p) = &opts.producer {
            if stream.closed {
                return Err(StoreError::StreamClosed);
            }
            match producer::validate(&stream.producers, &p.producer_id, p.epoch, p.seq) {
                ProducerOutcome::Duplicate { .. } => {
                    return Ok(AppendResult {
                        next_offset: stream.current_offset.clone(),
                        idempotent_replay: true,
                        stream_closed: stream.closed,
                    });
                }
                ProducerOutcome::StaleEpoch { .. } => {
                    return Err(StoreError::SequenceConflict(format!(
                        "stale epoch for producer {}",
                        p.producer_id
                    )));
                }
                ProducerOutcome::SequenceGap { expected, received } => {
                    return Err(StoreError::SequenceConflict(format!(
                        "expected seq {expected}, got {received}"
                    )));
                }
                ProducerOutcome::InvalidEpochSeq => {
                    return Err(StoreError::SequenceConflict(
                        "new epoch must start at seq 0".to_string(),
                    ));
                }
                ProducerOutcome::Accepted { proposed_epoch, proposed_seq } => {
                    producer_commit = Some((p.producer_id.clone(), proposed_epoch, proposed_seq));
                }
            }
        } else if stream.closed {
            return Err(StoreError::StreamClosed);
        }

        if let Some(seq) = opts.stream_seq {
            if let Some(last) = stream.last_seq {
                if seq <= last {
                    return Err(StoreError::SequenceConflict(format!(
                        "Stream-Seq {seq} <= last accepted {last}"
                    )));
                }
            }
        }

        let is_json = stream.is_json();
        let parts = framing::split_append_body(is_json, data, false)?;

        append_parts(stream, parts, now_ms);
        evict_expired(stream, self.max_retained_messages);

        if let Some(seq) = opts.stream_seq {
            stream.last_seq = Some(seq);
        }
        if let Some((producer_id, epoch, seq)) = producer_commit {
            producer::commit(&mut stream.producers, &producer_id, epoch, seq, now_ms);
            if opts.close {
                stream.closed = true;
                stream.closed_by = Some(ClosedBy { producer_id, epoch, seq });
            }
        } else if opts.close {
            stream.closed = true;
        }

        let result = AppendResult {
            next_offset: stream.current_offset.clone(),
            idempotent_replay: false,
            stream_closed: stream.closed,
        };
        drop(streams);

        debug!(path = %path, offset = %result.next_offset, "Appended to stream");
        self.wake(path);
        Ok(result)
    }

    /// Read every message with offset strictly greater than `offset`
    /// (`"-1"` or empty means "from the beginning").
    pub fn read(&self, path: &str, offset: &str) -> Result<ReadResult, StoreError> {
        let stream = self.get(path).ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        if offset != offset::BEFORE_BEGINNING && Offset::parse(offset).is_none() {
            return Err(StoreError::InvalidOffset(offset.to_string()));
        }

        if let Some(floor) = &stream.floor_offset {
            if offset::compare_rendered(offset, floor) == std::cmp::Ordering::Less {
                return Err(StoreError::OffsetExpired(offset.to_string()));
            }
        }

        let messages: Vec<StreamMessage> = stream
            .messages
            .iter()
            .filter(|m| offset::compare_rendered(&m.offset, offset) == std::cmp::Ordering::Greater)
            .cloned()
            .collect();

        let up_to_date = true; // a read always returns a current, complete snapshot
        Ok(ReadResult {
            messages,
            next_offset: stream.current_offset.clone(),
            up_to_date,
            stream_closed: stream.closed,
        })
    }

    pub fn format_response(&self, path: &str, messages: &[StreamMessage]) -> Vec<u8> {
        let is_json = self.get(path).map(|s| s.is_json()).unwrap_or(false);
        let bodies: Vec<Vec<u8>> = messages.iter().map(|m| m.data.clone()).collect();
        framing::format_response(is_json, &bodies)
    }

    /// Long-poll: wait up to `timeout_ms` for data past `offset`. Returns
    /// immediately if data is already available, or if the stream is closed
    /// at tail. Resolves with an empty payload if the stream is deleted or
    /// the process is shutting down while parked.
    pub async fn wait_for_messages(
        &self,
        path: &str,
        offset: &str,
        timeout_ms: u64,
    ) -> Result<WaitResult, StoreError> {
        // Register interest before checking for already-available data: a
        // `Notified` future created here captures `notify_waiters()` calls
        // that happen before it's first polled, so an `append()` landing in
        // the window between this line and the initial `read()` below is
        // not lost. Creating the future only after the check (the naive
        // order) would miss exactly that window, since `notify_waiters()`
        // does not buffer for waiters that register afterward.
        let notify = self.notifier(path);
        let notified = notify.notified();
        tokio::pin!(notified);

        let initial = self.read(path, offset)?;
        if !initial.messages.is_empty() {
            return Ok(WaitResult {
                messages: initial.messages,
                next_offset: initial.next_offset,
                timed_out: false,
                stream_closed: initial.stream_closed,
            });
        }
        if initial.stream_closed {
            return Ok(WaitResult {
                messages: vec![],
                next_offset: initial.next_offset,
                timed_out: false,
                stream_closed: true,
            });
        }
        if timeout_ms == 0 {
            return Ok(WaitResult {
                messages: vec![],
                next_offset: initial.next_offset,
                timed_out: true,
                stream_closed: false,
            });
        }

        let mut shutdown = self.shutdown.clone();

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                let current = self.read(path, offset);
                Ok(match current {
                    Ok(r) => WaitResult {
                        messages: r.messages,
                        next_offset: r.next_offset,
                        timed_out: true,
                        stream_closed: r.stream_closed,
                    },
                    Err(_) => WaitResult {
                        messages: vec![],
                        next_offset: offset.to_string(),
                        timed_out: true,
                        stream_closed: false,
                    },
                })
            }
            _ = &mut notified => {
                match self.read(path, offset) {
                    Ok(r) => Ok(WaitResult {
                        messages: r.messages,
                        next_offset: r.next_offset,
                        timed_out: false,
                        stream_closed: r.stream_closed,
                    }),
                    Err(_) => Ok(WaitResult {
                        messages: vec![],
                        next_offset: offset.to_string(),
                        timed_out: false,
                        stream_closed: false,
                    }),
                }
            }
            _ = shutdown.changed() => {
                Ok(WaitResult {
                    messages: vec![],
                    next_offset: offset.to_string(),
                    timed_out: false,
                    stream_closed: false,
                })
            }
        }
    }

    /// Subscribe to append/close/delete notifications for `path`, for the
    /// SSE pump (component D) to re-poll on.
    pub fn subscribe(&self, path: &str) -> Arc<Notify> {
        self.notifier(path)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    /// Sweep producer ledgers older than `max_age_ms` across every stream.
    /// Intended to be called periodically by a background task.
    pub fn gc_producers(&self, now_ms: i64, max_age_ms: i64) {
        let mut streams = self.streams.write();
        for stream in streams.values_mut() {
            producer::sweep_expired(&mut stream.producers, now_ms, max_age_ms);
        }
    }

    /// Next sequence number for `producer_id` in `path`'s ledger, i.e.
    /// `last_seq + 1` or `0` if the producer has never written here. Used to
    /// derive `Producer-Seq` for callers that authenticate via
    /// `Idempotency-Key` instead of the full `Producer-*` header set.
    pub fn next_producer_seq(&self, path: &str, producer_id: &str) -> u64 {
        let streams = self.streams.read();
        streams
            .get(path)
            .and_then(|s| s.producers.get(producer_id))
            .map(|state| state.last_seq + 1)
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn list(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }
}

/// Push framed parts onto a stream's log, advancing its offset for each.
fn append_parts(stream: &mut Stream, parts: Vec<Vec<u8>>, now_ms: i64) {
    for part in parts {
        let offset = stream.current_offset.clone();
        let len = part.len() as u64;
        let parsed = Offset::parse(&offset).unwrap_or_else(Offset::initial);
        stream.current_offset = parsed.advance(len).render();
        stream.messages.push(StreamMessage { data: part, offset, timestamp_ms: now_ms });
    }
}

/// Drop the oldest messages past `max_retained`, recording the offset of the
/// last evicted message as the new floor. `max_retained == 0` disables
/// retention.
fn evict_expired(stream: &mut Stream, max_retained: usize) {
    if max_retained == 0 || stream.messages.len() <= max_retained {
        return;
    }
    let excess = stream.messages.len() - max_retained;
    let evicted = stream.messages.drain(0..excess);
    stream.floor_offset = evicted.last().map(|m| m.offset);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_store() -> Arc<StreamStore> {
        let (_tx, rx) = watch::channel(false);
        StreamStore::new(rx)
    }

    #[test]
    fn create_and_get() {
        let store = new_store();
        let (stream, created) = store
            .create("/s", CreateOptions { content_type: Some("text/plain".into()), ..Default::default() })
            .unwrap();
        assert!(created);
        assert_eq!(stream.content_type, "text/plain");
        assert!(store.has("/s"));
    }

    #[test]
    fn create_is_idempotent_on_matching_config() {
        let store = new_store();
        let opts = CreateOptions { content_type: Some("text/plain".into()), ..Default::default() };
        let (_, created1) = store.create("/s", opts.clone()).unwrap();
        let (_, created2) = store.create("/s", opts).unwrap();
        assert!(created1);
        assert!(!created2);
    }

    #[test]
    fn create_conflict_on_mismatched_config() {
        let store = new_store();
        store.create("/s", CreateOptions { content_type: Some("text/plain".into()), ..Default::default() }).unwrap();
        let result = store.create("/s", CreateOptions { content_type: Some("application/json".into()), ..Default::default() });
        assert_eq!(result.unwrap_err(), StoreError::StreamConflict);
    }

    #[test]
    fn ttl_and_expires_at_conflict() {
        let store = new_store();
        let opts = CreateOptions {
            ttl_seconds: Some(60),
            expires_at: Some(Utc::now()),
            ..Default::default()
        };
        assert_eq!(store.create("/s", opts).unwrap_err(), StoreError::TtlConflict);
    }

    #[test]
    fn append_and_read_round_trip() {
        let store = new_store();
        store.create("/s", CreateOptions { content_type: Some("text/plain".into()), ..Default::default() }).unwrap();
        store.append("/s", b"hello".to_vec(), AppendOptions::default()).unwrap();
        store.append("/s", b"world".to_vec(), AppendOptions::default()).unwrap();

        let result = store.read("/s", offset::BEFORE_BEGINNING).unwrap();
        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.messages[0].data, b"hello");
        assert_eq!(result.messages[1].data, b"world");
    }

    #[test]
    fn read_after_offset_only_returns_newer_messages() {
        let store = new_store();
        store.create("/s", CreateOptions { content_type: Some("text/plain".into()), ..Default::default() }).unwrap();
        store.append("/s", b"a".to_vec(), AppendOptions::default()).unwrap();
        let after_first = store.read("/s", offset::BEFORE_BEGINNING).unwrap().next_offset;
        store.append("/s", b"b".to_vec(), AppendOptions::default()).unwrap();

        let result = store.read("/s", &after_first).unwrap();
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].data, b"b");
    }

    #[test]
    fn read_at_current_offset_is_empty() {
        let store = new_store();
        store.create("/s", CreateOptions::default()).unwrap();
        store.append("/s", b"a".to_vec(), AppendOptions::default()).unwrap();
        let tail = store.read("/s", offset::BEFORE_BEGINNING).unwrap().next_offset;
        let result = store.read("/s", &tail).unwrap();
        assert!(result.messages.is_empty());
    }

    #[test]
    fn content_type_mismatch_rejected() {
        let store = new_store();
        store.create("/s", CreateOptions { content_type: Some("text/plain".into()), ..Default::default() }).unwrap();
        let result = store.append(
            "/s",
            b"x".to_vec(),
            AppendOptions { content_type: Some("application/json".into()), ..Default::default() },
        );
        assert!(matches!(result, Err(StoreError::ContentTypeMismatch { .. })));
    }

    #[test]
    fn stream_seq_conflict() {
        let store = new_store();
        store.create("/s", CreateOptions::default()).unwrap();
        store
            .append("/s", b"A".to_vec(), AppendOptions { stream_seq: Some(10), ..Default::default() })
            .unwrap();
        let result = store.append("/s", b"B".to_vec(), AppendOptions { stream_seq: Some(5), ..Default::default() });
        assert!(matches!(result, Err(StoreError::SequenceConflict(_))));
    }

    #[test]
    fn json_batch_flattens_and_reads_back_wrapped() {
        let store = new_store();
        store.create("/s", CreateOptions { content_type: Some("application/json".into()), ..Default::default() }).unwrap();
        store.append("/s", br#"[{"a":1},{"a":2}]"#.to_vec(), AppendOptions::default()).unwrap();

        let result = store.read("/s", offset::BEFORE_BEGINNING).unwrap();
        assert_eq!(result.messages.len(), 2);
        let body = store.format_response("/s", &result.messages);
        assert_eq!(body, br#"[{"a":1},{"a":2}]"#);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = new_store();
        store.create("/s", CreateOptions::default()).unwrap();
        assert!(store.delete("/s"));
        assert!(!store.delete("/s"));
        assert!(!store.has("/s"));
    }

    #[test]
    fn producer_duplicate_is_replayed_not_conflict() {
        let store = new_store();
        store.create("/s", CreateOptions::default()).unwrap();
        let producer = super::super::types::ProducerHeaders { producer_id: "p".into(), epoch: 0, seq: 0 };
        let first = store
            .append("/s", b"A".to_vec(), AppendOptions { producer: Some(producer.clone()), ..Default::default() })
            .unwrap();
        let second = store
            .append("/s", b"A".to_vec(), AppendOptions { producer: Some(producer), ..Default::default() })
            .unwrap();
        assert!(!first.idempotent_replay);
        assert!(second.idempotent_replay);
        assert_eq!(first.next_offset, second.next_offset);
        assert_eq!(store.read("/s", offset::BEFORE_BEGINNING).unwrap().messages.len(), 1);
    }

    #[test]
    fn retention_evicts_oldest_and_expires_stale_offsets() {
        let (_tx, rx) = watch::channel(false);
        let store = StreamStore::with_retention(rx, 2);
        store.create("/s", CreateOptions::default()).unwrap();

        let after_a = store.append("/s", b"a".to_vec(), AppendOptions::default()).unwrap().next_offset;
        store.append("/s", b"b".to_vec(), AppendOptions::default()).unwrap();
        // Third append pushes retained count past the cap of 2, evicting "a".
        store.append("/s", b"c".to_vec(), AppendOptions::default()).unwrap();

        // A reader positioned just after "a" only missed "b" and "c", both
        // still retained, so it can keep going.
        let result = store.read("/s", &after_a).unwrap();
        assert_eq!(result.messages.len(), 2);

        // A reader still at the very beginning wants "a", which is gone.
        let err = store.read("/s", offset::BEFORE_BEGINNING).unwrap_err();
        assert!(matches!(err, StoreError::OffsetExpired(_)));
    }

    #[tokio::test]
    async fn wait_for_messages_returns_immediately_when_data_present() {
        let store = new_store();
        store.create("/s", CreateOptions::default()).unwrap();
        store.append("/s", b"x".to_vec(), AppendOptions::default()).unwrap();
        let result = store.wait_for_messages("/s", offset::BEFORE_BEGINNING, 1000).await.unwrap();
        assert!(!result.timed_out);
        assert_eq!(result.messages.len(), 1);
    }

    #[tokio::test]
    async fn wait_for_messages_times_out_with_no_data() {
        let store = new_store();
        store.create("/s", CreateOptions::default()).unwrap();
        let tail = store.read("/s", offset::BEFORE_BEGINNING).unwrap().next_offset;
        let result = store.wait_for_messages("/s", &tail, 50).await.unwrap();
        assert!(result.timed_out);
        assert!(result.messages.is_empty());
    }

    #[tokio::test]
    async fn wait_for_messages_wakes_on_append() {
        let store = new_store();
        store.create("/s", CreateOptions::default()).unwrap();
        let tail = store.read("/s", offset::BEFORE_BEGINNING).unwrap().next_offset;

        let waiter_store = store.clone();
        let tail_clone = tail.clone();
        let handle = tokio::spawn(async move {
            waiter_store.wait_for_messages("/s", &tail_clone, 5000).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("/s", b"woke".to_vec(), AppendOptions::default()).unwrap();

        let result = handle.await.unwrap();
        assert!(!result.timed_out);
        assert_eq!(result.messages[0].data, b"woke");
    }
}
