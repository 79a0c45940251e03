//! The canonical event surface shared by both transports.

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::Provider;

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The caller invoked `disconnect()`.
    Requested,
    /// The backend closed the transport, with its reason when it gave one.
    Remote(Option<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Transcript,
}

/// A text or transcript fragment produced by the assistant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentPayload {
    pub kind: ContentKind,
    pub text: String,
    /// `true` for the final, complete text of the part.
    pub done: bool,
}

/// A function call the assistant wants the caller to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    /// JSON-encoded arguments, exactly as the backend sent them.
    pub arguments: String,
}

/// The caller's answer to a [`ToolCall`].
#[derive(Clone, Debug, PartialEq)]
pub struct ToolResponse {
    pub call_id: String,
    pub output: Value,
}

/// Every event a caller can observe, regardless of the active provider.
#[derive(Clone, Debug, PartialEq)]
pub enum RealtimeEvent {
    Open,
    Close(CloseReason),
    /// PCM16 little-endian audio from the assistant.
    Audio(Bytes),
    Content(ContentPayload),
    Error(String),
    Interrupted,
    TurnComplete,
    SetupComplete,
    ToolCall(ToolCall),
    ProviderChanged(Provider),
}

impl RealtimeEvent {
    /// The wire-neutral name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            RealtimeEvent::Open => "open",
            RealtimeEvent::Close(_) => "close",
            RealtimeEvent::Audio(_) => "audio",
            RealtimeEvent::Content(_) => "content",
            RealtimeEvent::Error(_) => "error",
            RealtimeEvent::Interrupted => "interrupted",
            RealtimeEvent::TurnComplete => "turncomplete",
            RealtimeEvent::SetupComplete => "setupcomplete",
            RealtimeEvent::ToolCall(_) => "toolcall",
            RealtimeEvent::ProviderChanged(_) => "providerChanged",
        }
    }
}

/// A revocable subscription to the session's events.
///
/// Dropping the subscription (or calling [`Subscription::revoke`]) detaches it;
/// the hub prunes it on the next publish.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<RealtimeEvent>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<RealtimeEvent> {
        self.rx.recv().await
    }

    /// Returns an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<RealtimeEvent> {
        self.rx.try_recv().ok()
    }

    pub fn revoke(mut self) {
        self.rx.close();
    }
}

/// Fan-out of canonical events to every live subscription.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Vec<mpsc::UnboundedSender<RealtimeEvent>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        Subscription { rx }
    }

    pub fn publish(&mut self, event: RealtimeEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .iter()
            .filter(|subscriber| !subscriber.is_closed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let mut hub = EventHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.publish(RealtimeEvent::Open);
        hub.publish(RealtimeEvent::TurnComplete);

        assert_eq!(first.try_recv(), Some(RealtimeEvent::Open));
        assert_eq!(first.try_recv(), Some(RealtimeEvent::TurnComplete));
        assert_eq!(second.try_recv(), Some(RealtimeEvent::Open));
        assert_eq!(second.try_recv(), Some(RealtimeEvent::TurnComplete));
        assert_eq!(first.try_recv(), None);
    }

    #[test]
    fn test_revoked_subscriptions_are_pruned() {
        let mut hub = EventHub::new();
        let kept = hub.subscribe();
        let revoked = hub.subscribe();
        let dropped = hub.subscribe();

        revoked.revoke();
        drop(dropped);
        assert_eq!(hub.subscriber_count(), 1);

        hub.publish(RealtimeEvent::SetupComplete);
        assert_eq!(hub.subscribers.len(), 1);
        drop(kept);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(RealtimeEvent::TurnComplete.name(), "turncomplete");
        assert_eq!(
            RealtimeEvent::ProviderChanged(Provider::WebSocket).name(),
            "providerChanged"
        );
        assert_eq!(
            RealtimeEvent::Close(CloseReason::Remote(None)).name(),
            "close"
        );
    }
}
