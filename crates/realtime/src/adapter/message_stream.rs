//! Transport B: one persistent message connection carrying JSON only.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, error, info, warn};

use super::{AdapterContext, RealtimeAdapter, bounded};
use crate::{
    audio::DeliveryPolicy,
    config::{ConnectionConfig, Provider, TurnDetection},
    error::{RealtimeError, RealtimeResult},
    events::{CloseReason, RealtimeEvent, ToolResponse},
    protocol::{ClientEvent, ServerEvent},
};

/// Something read off the message connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamFrame {
    Text(String),
    /// The remote side closed, with its reason if it sent one.
    Closed(Option<String>),
}

/// Both directions of an open message connection.
///
/// Dropping `outbound` closes the connection.
#[derive(Debug)]
pub struct MessageStream {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<StreamFrame>,
}

/// Opens message connections.
#[async_trait]
pub trait MessageConnector: Send + Sync {
    async fn open(&self, url: &str, api_key: &SecretString) -> RealtimeResult<MessageStream>;
}

/// [`MessageConnector`] over a `tokio-tungstenite` WebSocket.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl MessageConnector for WebSocketConnector {
    async fn open(&self, url: &str, api_key: &SecretString) -> RealtimeResult<MessageStream> {
        let mut request = url.into_client_request()?;
        let bearer = format!("Bearer {}", api_key.expose_secret())
            .parse()
            .map_err(|_| RealtimeError::Connection("API key is not a valid header value".into()))?;
        request.headers_mut().insert("Authorization", bearer);
        request.headers_mut().insert(
            "OpenAI-Beta",
            "realtime=v1"
                .parse()
                .map_err(|_| RealtimeError::Connection("invalid OpenAI-Beta header".into()))?,
        );

        let (ws_stream, _) = connect_async(request).await?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        info!(url, "Connected to realtime WebSocket");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(text) => {
                            if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                                error!(error = %e, "Failed to send WebSocket message");
                                let _ = inbound_tx.send(StreamFrame::Closed(Some(e.to_string())));
                                break;
                            }
                        }
                        None => {
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            break;
                        }
                    },
                    message = ws_rx.next() => match message {
                        Some(Ok(WsMessage::Text(text))) => {
                            if inbound_tx.send(StreamFrame::Text(text.to_string())).is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = ws_tx.send(WsMessage::Pong(data)).await;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let reason = frame
                                .map(|frame| frame.reason.to_string())
                                .filter(|reason| !reason.is_empty());
                            let _ = inbound_tx.send(StreamFrame::Closed(reason));
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            let _ = inbound_tx.send(StreamFrame::Closed(Some(e.to_string())));
                            break;
                        }
                        None => {
                            let _ = inbound_tx.send(StreamFrame::Closed(None));
                            break;
                        }
                    },
                }
            }
            debug!("WebSocket task finished");
        });

        Ok(MessageStream { outbound, inbound })
    }
}

/// Adapter for the message-stream transport.
pub struct MessageStreamAdapter {
    connector: Arc<dyn MessageConnector>,
    url: String,
    api_key: Arc<SecretString>,
    step_timeout: Duration,
    batch_window: Duration,
    turn_detection: TurnDetection,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
}

impl MessageStreamAdapter {
    pub fn new(
        connector: Arc<dyn MessageConnector>,
        url: impl Into<String>,
        api_key: Arc<SecretString>,
    ) -> Self {
        Self {
            connector,
            url: url.into(),
            api_key,
            step_timeout: Duration::from_secs(10),
            batch_window: Duration::from_millis(100),
            turn_detection: TurnDetection::Manual,
            outbound: None,
            reader: None,
        }
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn with_batch_window(mut self, batch_window: Duration) -> Self {
        self.batch_window = batch_window;
        self
    }

    fn send(&self, event: &ClientEvent) -> RealtimeResult<()> {
        let outbound = self.outbound.as_ref().ok_or(RealtimeError::NotConnected)?;
        outbound
            .send(event.to_json()?)
            .map_err(|_| RealtimeError::Connection("message connection closed".to_string()))
    }
}

#[async_trait]
impl RealtimeAdapter for MessageStreamAdapter {
    fn provider(&self) -> Provider {
        Provider::WebSocket
    }

    async fn connect(
        &mut self,
        config: &ConnectionConfig,
        ctx: AdapterContext,
    ) -> RealtimeResult<()> {
        let url = format!("{}?model={}", self.url, config.model);
        let stream = bounded(
            "message connection open",
            self.step_timeout,
            self.connector.open(&url, &self.api_key),
        )
        .await?;
        let MessageStream {
            outbound,
            mut inbound,
        } = stream;

        self.turn_detection = config.extras.turn_detection.clone();
        self.outbound = Some(outbound);
        self.send(&ClientEvent::session_update(config))?;

        self.reader = Some(tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match frame {
                    StreamFrame::Text(text) => forward(&ctx, &text),
                    StreamFrame::Closed(reason) => {
                        info!(?reason, "Message connection closed by remote");
                        ctx.emit(RealtimeEvent::Close(CloseReason::Remote(reason)));
                        return;
                    }
                }
            }
            ctx.emit(RealtimeEvent::Close(CloseReason::Remote(None)));
        }));

        info!(model = %config.model, voice = %config.voice, "Message-stream session configured");
        Ok(())
    }

    async fn disconnect(&mut self) -> bool {
        let had_outbound = self.outbound.take().is_some();
        let had_reader = match self.reader.take() {
            Some(reader) => {
                reader.abort();
                true
            }
            None => false,
        };
        had_outbound || had_reader
    }

    async fn send_audio(&mut self, pcm16: Bytes) -> RealtimeResult<()> {
        self.send(&ClientEvent::audio_append(&pcm16))
    }

    async fn send_text(&mut self, text: &str) -> RealtimeResult<()> {
        self.send(&ClientEvent::user_text(text))?;
        self.send(&ClientEvent::ResponseCreate)
    }

    async fn send_tool_response(&mut self, response: &ToolResponse) -> RealtimeResult<()> {
        self.send(&ClientEvent::tool_output(response))?;
        self.send(&ClientEvent::ResponseCreate)
    }

    async fn update_config(&mut self, config: &ConnectionConfig) -> RealtimeResult<()> {
        self.send(&ClientEvent::session_update(config))?;
        self.turn_detection = config.extras.turn_detection.clone();
        Ok(())
    }

    async fn end_turn(&mut self) -> RealtimeResult<()> {
        self.send(&ClientEvent::InputAudioBufferCommit)?;
        self.send(&ClientEvent::ResponseCreate)
    }

    fn requires_explicit_end_of_turn(&self) -> bool {
        matches!(self.turn_detection, TurnDetection::Manual)
    }

    fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy::Batched {
            window: self.batch_window,
        }
    }
}

/// Parses one inbound message and forwards its canonical form.
pub(crate) fn forward(ctx: &AdapterContext, text: &str) {
    let event = match ServerEvent::parse(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Dropping malformed realtime message");
            return;
        }
    };
    if matches!(event, ServerEvent::SessionCreated | ServerEvent::SessionUpdated) {
        debug!(?event, "Session acknowledged by backend");
        return;
    }
    match event.into_canonical() {
        Ok(Some(canonical)) => ctx.emit(canonical),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Dropping undecodable realtime message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{NullSink, PlaybackQueue};
    use serde_json::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct LoopbackConnector {
        opened: Mutex<Vec<String>>,
        remote: Mutex<Option<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<StreamFrame>)>>,
    }

    #[async_trait]
    impl MessageConnector for LoopbackConnector {
        async fn open(&self, url: &str, api_key: &SecretString) -> RealtimeResult<MessageStream> {
            assert_eq!(api_key.expose_secret(), "sk-test");
            self.opened.lock().unwrap().push(url.to_string());
            let (outbound, sent) = mpsc::unbounded_channel();
            let (replies, inbound) = mpsc::unbounded_channel();
            *self.remote.lock().unwrap() = Some((sent, replies));
            Ok(MessageStream { outbound, inbound })
        }
    }

    fn adapter(connector: Arc<LoopbackConnector>) -> MessageStreamAdapter {
        MessageStreamAdapter::new(
            connector,
            "wss://example.test/v1/realtime",
            Arc::new(SecretString::from("sk-test".to_string())),
        )
    }

    fn context() -> (AdapterContext, mpsc::UnboundedReceiver<RealtimeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ctx = AdapterContext {
            events,
            playback: PlaybackQueue::spawn(NullSink),
        };
        (ctx, rx)
    }

    fn types(sent: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(raw) = sent.try_recv() {
            let value: Value = serde_json::from_str(&raw).unwrap();
            types.push(value["type"].as_str().unwrap().to_string());
        }
        types
    }

    #[tokio::test]
    async fn test_connect_sends_session_update_first() {
        let connector = Arc::new(LoopbackConnector::default());
        let mut adapter = adapter(connector.clone());
        let (ctx, _events) = context();
        let config = ConnectionConfig::defaults_for(Provider::WebSocket);

        adapter.connect(&config, ctx).await.unwrap();

        assert_eq!(
            connector.opened.lock().unwrap().as_slice(),
            [format!("wss://example.test/v1/realtime?model={}", config.model)]
        );
        let (mut sent, _) = connector.remote.lock().unwrap().take().unwrap();
        assert_eq!(types(&mut sent), vec!["session.update"]);
        assert!(adapter.requires_explicit_end_of_turn());
    }

    #[tokio::test]
    async fn test_end_turn_commits_then_requests_response() {
        let connector = Arc::new(LoopbackConnector::default());
        let mut adapter = adapter(connector.clone());
        let (ctx, _events) = context();
        adapter
            .connect(&ConnectionConfig::defaults_for(Provider::WebSocket), ctx)
            .await
            .unwrap();
        let (mut sent, _) = connector.remote.lock().unwrap().take().unwrap();
        types(&mut sent);

        adapter.send_audio(Bytes::from_static(&[1, 0, 2, 0])).await.unwrap();
        adapter.end_turn().await.unwrap();

        assert_eq!(
            types(&mut sent),
            vec![
                "input_audio_buffer.append",
                "input_audio_buffer.commit",
                "response.create"
            ]
        );
    }

    #[tokio::test]
    async fn test_update_config_switches_to_server_vad() {
        let connector = Arc::new(LoopbackConnector::default());
        let mut adapter = adapter(connector.clone());
        let (ctx, _events) = context();
        let mut config = ConnectionConfig::defaults_for(Provider::WebSocket);
        adapter.connect(&config, ctx).await.unwrap();
        let (mut sent, _) = connector.remote.lock().unwrap().take().unwrap();
        types(&mut sent);

        config.extras.turn_detection = TurnDetection::server_vad();
        adapter.update_config(&config).await.unwrap();

        let raw = sent.try_recv().unwrap();
        let update: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(update["type"], "session.update");
        assert_eq!(update["session"]["turn_detection"]["type"], "server_vad");
        assert!(!adapter.requires_explicit_end_of_turn());
    }

    #[tokio::test]
    async fn test_inbound_mapping_and_remote_close() {
        let connector = Arc::new(LoopbackConnector::default());
        let mut adapter = adapter(connector.clone());
        let (ctx, mut events) = context();
        adapter
            .connect(&ConnectionConfig::defaults_for(Provider::WebSocket), ctx)
            .await
            .unwrap();
        let (_sent, replies) = connector.remote.lock().unwrap().take().unwrap();

        for raw in [
            r#"{"type":"session.updated","session":{}}"#,
            "this is not json",
            r#"{"type":"response.cancelled"}"#,
            r#"{"type":"response.done","response":{}}"#,
        ] {
            replies.send(StreamFrame::Text(raw.to_string())).unwrap();
        }
        replies
            .send(StreamFrame::Closed(Some("going away".to_string())))
            .unwrap();

        assert_eq!(events.recv().await, Some(RealtimeEvent::Interrupted));
        assert_eq!(events.recv().await, Some(RealtimeEvent::TurnComplete));
        assert_eq!(
            events.recv().await,
            Some(RealtimeEvent::Close(CloseReason::Remote(Some(
                "going away".to_string()
            ))))
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_closes_outbound() {
        let connector = Arc::new(LoopbackConnector::default());
        let mut adapter = adapter(connector.clone());
        let (ctx, _events) = context();
        adapter
            .connect(&ConnectionConfig::defaults_for(Provider::WebSocket), ctx)
            .await
            .unwrap();
        let (mut sent, _replies) = connector.remote.lock().unwrap().take().unwrap();

        assert!(adapter.disconnect().await);
        assert!(!adapter.disconnect().await);
        types(&mut sent);
        assert!(sent.recv().await.is_none());
        assert!(matches!(
            adapter.send_text("late").await,
            Err(RealtimeError::NotConnected)
        ));
    }
}
