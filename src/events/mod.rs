//! Job event fan-out.
//!
//! # Data Flow
//! ```text
//! JobQueue transition → EventEnvelope → EventBridge::emit
//!     → per-run ring buffer (bounded, oldest evicted)
//!     → every matching attached sink (run filter or wildcard)
//!     → sse.rs: `data: <json>\n\n` frames to HTTP clients
//! ```

pub mod bridge;
pub mod envelope;
pub mod sse;

pub use bridge::{BridgeError, ChannelSink, EventBridge, EventSink, SinkError};
pub use envelope::{EventEnvelope, JobEventType};
