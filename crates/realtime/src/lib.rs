//! voxbridge realtime session layer
//!
//! This crate lets a caller hold a bidirectional voice+text conversation with
//! one of two realtime backends through a single provider-agnostic session:
//!
//! - `adapter`: the two transports the session multiplexes over, a WebRTC-style
//!   media-track transport and a WebSocket-style message-stream transport.
//! - `audio`: microphone capture/framing/batching and sequential playback.
//! - `session`: the connection state machine and provider switching.
//! - `client`: a cloneable handle that serializes commands into the session task.
//! - `events` / `protocol`: the canonical event surface and the shared JSON vocabulary.

pub mod adapter;
pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;

pub use client::RealtimeClient;
pub use config::{Config, ConnectionConfig, Provider};
pub use error::{RealtimeError, RealtimeResult};
pub use events::{RealtimeEvent, Subscription};
pub use session::{Session, SessionStatus};
