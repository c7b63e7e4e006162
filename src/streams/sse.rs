//! Server-Sent Events pump (component D, SSE half).
//!
//! Grounded on the reference `create_sse_stream` (moneymq's
//! `crates/stream/src/server.rs`): replay everything since the requested
//! offset, then tail the stream with a periodic control frame so idle
//! connections don't look dead to proxies. Extended per the non-JSON framing
//! decision in `SPEC_FULL.md` §A.1: JSON streams emit the message's literal
//! JSON text as the `data:` payload; non-JSON streams base64-encode each
//! message onto a single `data:` line.
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::response::sse::Event;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::Stream as FuturesStream;

use super::offset;
use super::store::StreamStore;

/// How often to emit an `event: control` keepalive frame while a connection
/// is idle (no new data arriving).
const CONTROL_INTERVAL: Duration = Duration::from_secs(15);

/// Build an infinite stream of SSE events for `path`, starting just after
/// `from_offset`. Ends (stops yielding) once the stream is deleted, closed
/// and drained, or the process is shutting down.
pub fn sse_stream(
    store: Arc<StreamStore>,
    path: String,
    from_offset: String,
) -> impl FuturesStream<Item = Result<Event, axum::Error>> {
    stream! {
        let mut cursor = from_offset;
        let is_json = store.get(&path).map(|s| s.is_json()).unwrap_or(false);

        loop {
            let wait = store
                .wait_for_messages(&path, &cursor, CONTROL_INTERVAL.as_millis() as u64)
                .await;

            let result = match wait {
                Ok(r) => r,
                Err(_) => {
                    // Stream vanished mid-poll; tell the client and stop.
                    yield Ok(Event::default().event("control").data(r#"{"status":"stream_deleted"}"#.to_string()));
                    break;
                }
            };

            for msg in &result.messages {
                let payload = if is_json {
                    String::from_utf8_lossy(&msg.data).into_owned()
                } else {
                    BASE64.encode(&msg.data)
                };
                yield Ok(Event::default().event("data").id(msg.offset.clone()).data(payload));
                cursor = msg.offset.clone();
            }

            // Interleaved after every batch, empty or not, so idle
            // connections get a keepalive and active ones get an ack point.
            yield Ok(Event::default().event("control").data(format!(r#"{{"offset":"{cursor}"}}"#)));

            if result.stream_closed && offset::compare_rendered(&cursor, &result.next_offset) != std::cmp::Ordering::Less {
                yield Ok(Event::default().event("control").data(r#"{"streamClosed":true}"#.to_string()));
                break;
            }
        }
    }
}
