//! The connection state machine and provider switching.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{AdapterContext, MessageStreamAdapter, RealtimeAdapter, WebSocketConnector},
    audio::{AudioSource, CaptureHandle, PlaybackHandle},
    config::{Config, ConnectionConfig, Provider},
    error::{RealtimeError, RealtimeResult},
    events::{CloseReason, EventHub, RealtimeEvent, Subscription, ToolResponse},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
        }
    }
}

/// Something the session has to react to besides caller commands.
#[derive(Debug)]
pub enum SessionInput {
    /// A canonical event from the active adapter.
    Adapter(RealtimeEvent),
    /// The active adapter dropped its event sender.
    AdapterGone,
    /// Captured audio ready for the transport.
    Captured(Bytes),
    /// The audio source ended on its own.
    CaptureEnded,
}

/// One realtime conversation, bound to one provider at a time.
pub struct Session {
    provider: Provider,
    status: SessionStatus,
    adapters: HashMap<Provider, Box<dyn RealtimeAdapter>>,
    config: ConnectionConfig,
    hub: EventHub,
    playback: PlaybackHandle,
    adapter_events: Option<mpsc::UnboundedReceiver<RealtimeEvent>>,
    capture: Option<CaptureHandle>,
    frame_samples: usize,
}

impl Session {
    pub fn new(provider: Provider, playback: PlaybackHandle) -> Self {
        Self {
            provider,
            status: SessionStatus::Disconnected,
            adapters: HashMap::new(),
            config: ConnectionConfig::defaults_for(provider),
            hub: EventHub::new(),
            playback,
            adapter_events: None,
            capture: None,
            frame_samples: 480,
        }
    }

    /// Registers the adapter for its provider, replacing any previous one.
    pub fn with_adapter(mut self, adapter: Box<dyn RealtimeAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    pub fn with_frame_samples(mut self, frame_samples: usize) -> Self {
        self.frame_samples = frame_samples.max(1);
        self
    }

    /// Builds a session with every transport the configuration has credentials for.
    pub fn from_config(config: &Config, playback: PlaybackHandle) -> RealtimeResult<Self> {
        let mut session =
            Session::new(config.provider, playback).with_frame_samples(config.frame_samples);

        if let Some(api_key) = &config.websocket_api_key {
            let adapter = MessageStreamAdapter::new(
                Arc::new(WebSocketConnector),
                config.websocket_url.clone(),
                api_key.clone(),
            )
            .with_step_timeout(config.step_timeout)
            .with_batch_window(config.batch_window);
            session = session.with_adapter(Box::new(adapter));
        }
        if let Some(adapter) = media_track_adapter(config) {
            session = session.with_adapter(adapter);
        }

        if !session.adapters.contains_key(&config.provider) {
            return Err(RealtimeError::Misuse(format!(
                "no transport available for provider {}",
                config.provider
            )));
        }
        session.config = config.connection_config(config.provider);
        Ok(session)
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Whether an adapter is registered for `provider`.
    pub fn supports(&self, provider: Provider) -> bool {
        self.adapters.contains_key(&provider)
    }

    /// The snapshot used by the last connect, or the provider defaults.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_some()
    }

    pub fn subscribe(&mut self) -> Subscription {
        let subscription = self.hub.subscribe();
        debug!(subscribers = self.hub.subscriber_count(), "Event subscription added");
        subscription
    }

    /// Connects the active adapter. Rejected unless disconnected.
    pub async fn connect(&mut self, config: ConnectionConfig) -> RealtimeResult<()> {
        if self.status != SessionStatus::Disconnected {
            debug!(status = %self.status, "Rejecting connect, session is busy");
            return Err(RealtimeError::Misuse(format!(
                "connect while {}",
                self.status
            )));
        }
        let Some(adapter) = self.adapters.get_mut(&self.provider) else {
            return Err(RealtimeError::Misuse(format!(
                "no adapter registered for {}",
                self.provider
            )));
        };

        info!(provider = %self.provider, model = %config.model, voice = %config.voice, "Connecting realtime session");
        self.status = SessionStatus::Connecting;
        self.config = config;

        let (events, adapter_events) = mpsc::unbounded_channel();
        self.adapter_events = Some(adapter_events);
        let ctx = AdapterContext {
            events,
            playback: self.playback.clone(),
        };

        match adapter.connect(&self.config, ctx).await {
            Ok(()) => {
                self.status = SessionStatus::Connected;
                info!(provider = %self.provider, "Realtime session connected");
                self.hub.publish(RealtimeEvent::Open);
                Ok(())
            }
            Err(e) => {
                error!(provider = %self.provider, error = %e, "Realtime connect failed");
                adapter.disconnect().await;
                self.adapter_events = None;
                self.status = SessionStatus::Disconnected;
                self.hub.publish(RealtimeEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Tears the connection down from any state. Returns `false` when there
    /// was nothing to do.
    pub async fn disconnect(&mut self) -> bool {
        if self.status == SessionStatus::Disconnected {
            debug!("Disconnect requested while already disconnected");
            return false;
        }
        self.teardown().await;
        info!(provider = %self.provider, "Realtime session disconnected");
        self.hub.publish(RealtimeEvent::Close(CloseReason::Requested));
        true
    }

    async fn teardown(&mut self) {
        if let Some(capture) = self.capture.take() {
            let dropped = capture.stop().await;
            debug!(chunks = dropped.len(), "Discarding captured audio on teardown");
        }
        self.adapter_events = None;
        if let Some(adapter) = self.adapters.get_mut(&self.provider) {
            adapter.disconnect().await;
        }
        self.playback.interrupt();
        self.status = SessionStatus::Disconnected;
    }

    fn connected_adapter(&mut self, what: &str) -> Option<&mut Box<dyn RealtimeAdapter>> {
        if self.status != SessionStatus::Connected {
            debug!(status = %self.status, "Dropping {}, session not connected", what);
            return None;
        }
        self.adapters.get_mut(&self.provider)
    }

    pub async fn send_audio(&mut self, pcm16: Bytes) -> bool {
        let Some(adapter) = self.connected_adapter("audio") else {
            return false;
        };
        delivered("audio", adapter.send_audio(pcm16).await)
    }

    pub async fn send_text(&mut self, text: &str) -> bool {
        let Some(adapter) = self.connected_adapter("text") else {
            return false;
        };
        delivered("text", adapter.send_text(text).await)
    }

    pub async fn send_tool_response(&mut self, response: &ToolResponse) -> bool {
        let Some(adapter) = self.connected_adapter("tool response") else {
            return false;
        };
        delivered("tool response", adapter.send_tool_response(response).await)
    }

    /// Remembers `config` and pushes it to the backend when connected.
    pub async fn update_config(&mut self, config: ConnectionConfig) -> RealtimeResult<()> {
        if self.status == SessionStatus::Connected {
            if let Some(adapter) = self.adapters.get_mut(&self.provider) {
                adapter.update_config(&config).await?;
            }
        }
        self.config = config;
        Ok(())
    }

    /// Moves to `target`. Returns `false` when already there.
    pub async fn switch_provider(&mut self, target: Provider) -> RealtimeResult<bool> {
        if target == self.provider {
            debug!(provider = %target, "Already on requested provider");
            return Ok(false);
        }
        if !self.adapters.contains_key(&target) {
            return Err(RealtimeError::Misuse(format!(
                "no adapter registered for {}",
                target
            )));
        }

        let _ = self.disconnect().await;
        self.provider = target;
        self.config = ConnectionConfig::defaults_for(target);
        info!(provider = %target, "Switched realtime provider");
        self.hub.publish(RealtimeEvent::ProviderChanged(target));
        Ok(true)
    }

    /// Starts streaming `source` into the active transport.
    pub async fn start_recording(&mut self, source: Box<dyn AudioSource>) -> RealtimeResult<()> {
        if self.status != SessionStatus::Connected {
            return Err(RealtimeError::Misuse(format!(
                "start recording while {}",
                self.status
            )));
        }
        if self.capture.is_some() {
            return Err(RealtimeError::Misuse("already recording".to_string()));
        }
        let Some(adapter) = self.adapters.get(&self.provider) else {
            return Err(RealtimeError::NotConnected);
        };
        let policy = adapter.delivery_policy();
        self.capture = Some(CaptureHandle::start(source, self.frame_samples, policy).await?);
        Ok(())
    }

    /// Stops capture, sends every remaining frame, then ends the turn if the
    /// transport needs it. Returns `false` when nothing was recording.
    pub async fn stop_recording(&mut self) -> bool {
        let Some(capture) = self.capture.take() else {
            debug!("Stop requested while not recording");
            return false;
        };
        for chunk in capture.stop().await {
            self.send_audio(chunk).await;
        }

        if let Some(adapter) = self.connected_adapter("end of turn") {
            if adapter.requires_explicit_end_of_turn() {
                if let Err(e) = adapter.end_turn().await {
                    error!(error = %e, "Failed to signal end of turn");
                }
            }
        }
        true
    }

    /// Waits for the next adapter event or captured chunk.
    pub async fn next_input(&mut self) -> SessionInput {
        tokio::select! {
            event = next_event(&mut self.adapter_events) => match event {
                Some(event) => SessionInput::Adapter(event),
                None => SessionInput::AdapterGone,
            },
            chunk = next_chunk(&mut self.capture) => match chunk {
                Some(chunk) => SessionInput::Captured(chunk),
                None => SessionInput::CaptureEnded,
            },
        }
    }

    pub async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Adapter(event) => self.handle_adapter_event(event).await,
            SessionInput::AdapterGone => {
                debug!("Adapter event stream ended");
                self.adapter_events = None;
            }
            SessionInput::Captured(chunk) => {
                self.send_audio(chunk).await;
            }
            SessionInput::CaptureEnded => {
                warn!("Audio source ended unexpectedly");
                self.stop_recording().await;
            }
        }
    }

    async fn handle_adapter_event(&mut self, event: RealtimeEvent) {
        match &event {
            RealtimeEvent::Audio(pcm16) => self.playback.enqueue(pcm16),
            RealtimeEvent::Interrupted => self.playback.interrupt(),
            RealtimeEvent::Close(CloseReason::Remote(reason)) => {
                if self.status == SessionStatus::Disconnected {
                    return;
                }
                warn!(provider = %self.provider, ?reason, "Realtime connection closed by remote");
                self.teardown().await;
            }
            _ => {}
        }
        self.hub.publish(event);
    }

    /// Disconnects and stops playback.
    pub async fn close(mut self) {
        self.disconnect().await;
        self.playback.shutdown();
    }
}

fn delivered(what: &str, result: RealtimeResult<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Failed to send {}", what);
            false
        }
    }
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<RealtimeEvent>>,
) -> Option<RealtimeEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_chunk(capture: &mut Option<CaptureHandle>) -> Option<Bytes> {
    match capture {
        Some(capture) => capture.next_chunk().await,
        None => std::future::pending().await,
    }
}

#[cfg(feature = "webrtc")]
fn media_track_adapter(config: &Config) -> Option<Box<dyn RealtimeAdapter>> {
    use crate::adapter::{MediaTrackAdapter, Signalling, webrtc::WebRtcConnector};

    let api_key = config.openai_api_key.clone()?;
    let adapter = MediaTrackAdapter::new(
        Signalling::new(config.api_base.clone(), api_key),
        Arc::new(WebRtcConnector::with_ice_servers(config.ice_servers.clone())),
    )
    .with_step_timeout(config.step_timeout);
    Some(Box::new(adapter))
}

#[cfg(not(feature = "webrtc"))]
fn media_track_adapter(_config: &Config) -> Option<Box<dyn RealtimeAdapter>> {
    None
}
