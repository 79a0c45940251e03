//! The transports a session can run over, behind one capability set.

pub mod media_track;
pub mod message_stream;
#[cfg(feature = "webrtc")]
pub mod webrtc;

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{
    audio::{DeliveryPolicy, PlaybackHandle},
    config::{ConnectionConfig, Provider},
    error::{RealtimeError, RealtimeResult},
    events::{RealtimeEvent, ToolResponse},
};

pub use media_track::{MediaTrackAdapter, PeerConnector, PeerLink, Signalling};
pub use message_stream::{
    MessageConnector, MessageStream, MessageStreamAdapter, StreamFrame, WebSocketConnector,
};

/// What a connect attempt hands to the adapter.
#[derive(Clone, Debug)]
pub struct AdapterContext {
    /// Canonical events go here. The receiving end belongs to one connect
    /// attempt and is dropped when the session detaches from the adapter.
    pub events: mpsc::UnboundedSender<RealtimeEvent>,
    pub playback: PlaybackHandle,
}

impl AdapterContext {
    pub fn emit(&self, event: RealtimeEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Session detached, dropping adapter event");
        }
    }
}

/// One realtime transport.
///
/// `send_*` calls are only made while connected; a closed transport answers
/// with [`RealtimeError::NotConnected`] or [`RealtimeError::Connection`].
#[async_trait]
pub trait RealtimeAdapter: Send {
    fn provider(&self) -> Provider;

    /// Establishes the transport. On failure everything opened so far is released.
    async fn connect(&mut self, config: &ConnectionConfig, ctx: AdapterContext)
    -> RealtimeResult<()>;

    /// Releases every transport resource. Returns `false` when nothing was open.
    async fn disconnect(&mut self) -> bool;

    async fn send_audio(&mut self, pcm16: Bytes) -> RealtimeResult<()>;

    async fn send_text(&mut self, text: &str) -> RealtimeResult<()>;

    async fn send_tool_response(&mut self, response: &ToolResponse) -> RealtimeResult<()>;

    /// Pushes a new `session.update` over the open transport.
    async fn update_config(&mut self, config: &ConnectionConfig) -> RealtimeResult<()>;

    /// Marks the end of the user's audio turn.
    async fn end_turn(&mut self) -> RealtimeResult<()>;

    /// Whether the caller must invoke [`RealtimeAdapter::end_turn`] after the
    /// last captured audio.
    fn requires_explicit_end_of_turn(&self) -> bool;

    fn delivery_policy(&self) -> DeliveryPolicy;
}

/// Runs one network step with an upper bound on its duration.
pub(crate) async fn bounded<T, F>(step: &str, limit: Duration, fut: F) -> RealtimeResult<T>
where
    F: Future<Output = RealtimeResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RealtimeError::Timeout(format!(
            "{} did not finish within {:?}",
            step, limit
        ))),
    }
}
