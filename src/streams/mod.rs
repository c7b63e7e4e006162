//! Core stream engine: offset codec, content-type framing, the producer
//! ledger, the in-memory store, and the SSE pump built on top of it.

pub mod framing;
pub mod offset;
pub mod producer;
pub mod sse;
pub mod store;
pub mod types;

pub use store::{StoreError, StreamStore};
pub use types::{AppendOptions, AppendResult, CreateOptions, ProducerHeaders, ReadResult, Stream, WaitResult};
