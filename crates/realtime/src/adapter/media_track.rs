//! Transport A: ephemeral credential, SDP offer/answer over HTTPS, audio on
//! a media track and JSON control events on the `oai-events` data channel.

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use super::{AdapterContext, RealtimeAdapter, bounded, message_stream::forward};
use crate::{
    audio::{DeliveryPolicy, PCM16_SAMPLE_RATE},
    config::{ConnectionConfig, Provider, TurnDetection},
    error::{RealtimeError, RealtimeResult},
    events::{CloseReason, RealtimeEvent, ToolResponse},
    protocol::ClientEvent,
};

pub const DATA_CHANNEL_LABEL: &str = "oai-events";

/// Data channel activity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Closed,
}

/// An ordered data channel. Messages written to `outbound` before the
/// channel opens are the link's to buffer or drop.
#[derive(Debug)]
pub struct DataChannel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// One peer connection, built step by step by [`MediaTrackAdapter::connect`].
#[async_trait]
pub trait PeerLink: Send {
    /// Adds the local audio track that [`PeerLink::write_audio`] feeds.
    async fn attach_microphone(&mut self, sample_rate: u32) -> RealtimeResult<()>;

    async fn open_data_channel(&mut self, label: &str) -> RealtimeResult<DataChannel>;

    /// Creates the local offer and applies it as the local description.
    async fn create_offer(&mut self) -> RealtimeResult<String>;

    async fn accept_answer(&mut self, sdp: String) -> RealtimeResult<()>;

    /// PCM16 little-endian audio decoded from the remote track. Taken once.
    fn take_remote_audio(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>>;

    async fn write_audio(&mut self, pcm16: Bytes) -> RealtimeResult<()>;

    async fn close(&mut self);
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(&self) -> RealtimeResult<Box<dyn PeerLink>>;
}

#[derive(Debug, Serialize)]
struct CredentialRequest<'a> {
    model: &'a str,
    voice: &'a str,
    instructions: &'a str,
}

#[derive(Debug, Deserialize)]
struct CredentialResponse {
    client_secret: ClientSecret,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
}

#[derive(Debug, Deserialize)]
struct SdpAnswer {
    sdp: String,
}

/// The HTTPS half of the handshake: credential issuance and SDP exchange.
#[derive(Clone, Debug)]
pub struct Signalling {
    http: reqwest::Client,
    api_base: String,
    api_key: Arc<SecretString>,
}

impl Signalling {
    pub fn new(api_base: impl Into<String>, api_key: Arc<SecretString>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// `POST <base>/realtime/sessions`, returning the short-lived client secret.
    pub async fn fetch_credential(&self, config: &ConnectionConfig) -> RealtimeResult<SecretString> {
        let url = format!("{}/realtime/sessions", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&CredentialRequest {
                model: &config.model,
                voice: &config.voice,
                instructions: &config.instructions,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RealtimeError::Connection(format!(
                "credential request failed with status {}: {}",
                status, body
            )));
        }

        let credential: CredentialResponse = response.json().await.map_err(|e| {
            RealtimeError::Connection(format!("failed to parse credential response: {}", e))
        })?;
        Ok(SecretString::from(credential.client_secret.value))
    }

    /// `POST <base>/realtime?model=<model>` with the local offer; returns the answer.
    pub async fn exchange_sdp(
        &self,
        model: &str,
        credential: &SecretString,
        offer: String,
    ) -> RealtimeResult<String> {
        let url = format!("{}/realtime", self.api_base);
        let response = self
            .http
            .post(&url)
            .query(&[("model", model)])
            .bearer_auth(credential.expose_secret())
            .header(reqwest::header::CONTENT_TYPE, "application/sdp")
            .body(offer)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RealtimeError::Connection(format!(
                "SDP exchange failed with status {}: {}",
                status, body
            )));
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));
        let body = response.text().await?;
        if is_json {
            let answer: SdpAnswer = serde_json::from_str(&body).map_err(|e| {
                RealtimeError::Connection(format!("failed to parse SDP answer: {}", e))
            })?;
            Ok(answer.sdp)
        } else {
            Ok(body)
        }
    }
}

/// Adapter for the media-track transport.
pub struct MediaTrackAdapter {
    signalling: Signalling,
    connector: Arc<dyn PeerConnector>,
    step_timeout: Duration,
    turn_detection: TurnDetection,
    link: Option<Box<dyn PeerLink>>,
    control: Option<mpsc::UnboundedSender<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MediaTrackAdapter {
    pub fn new(signalling: Signalling, connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            signalling,
            connector,
            step_timeout: Duration::from_secs(10),
            turn_detection: TurnDetection::server_vad(),
            link: None,
            control: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    async fn establish(
        &mut self,
        config: &ConnectionConfig,
        ctx: &AdapterContext,
    ) -> RealtimeResult<()> {
        let credential = bounded(
            "credential request",
            self.step_timeout,
            self.signalling.fetch_credential(config),
        )
        .await?;
        debug!("Obtained ephemeral credential");

        let link = self.link.insert(self.connector.create().await?);
        link.attach_microphone(PCM16_SAMPLE_RATE).await?;
        let channel = link.open_data_channel(DATA_CHANNEL_LABEL).await?;
        let offer = link.create_offer().await?;
        let answer = bounded(
            "SDP exchange",
            self.step_timeout,
            self.signalling.exchange_sdp(&config.model, &credential, offer),
        )
        .await?;
        link.accept_answer(answer).await?;

        if let Some(remote_audio) = link.take_remote_audio() {
            self.tasks.push(tokio::spawn(route_remote_audio(
                remote_audio,
                ctx.clone(),
            )));
        }

        let DataChannel { outbound, inbound } = channel;
        self.control = Some(outbound.clone());
        self.tasks.push(tokio::spawn(run_control_channel(
            inbound,
            outbound,
            ClientEvent::session_update(config),
            ctx.clone(),
        )));
        self.turn_detection = config.extras.turn_detection.clone();
        Ok(())
    }

    async fn teardown(&mut self) -> bool {
        let mut released = false;
        for task in self.tasks.drain(..) {
            task.abort();
            released = true;
        }
        if self.control.take().is_some() {
            released = true;
        }
        if let Some(mut link) = self.link.take() {
            link.close().await;
            released = true;
        }
        released
    }

    fn send_control(&self, event: &ClientEvent) -> RealtimeResult<()> {
        let control = self.control.as_ref().ok_or(RealtimeError::NotConnected)?;
        control
            .send(event.to_json()?)
            .map_err(|_| RealtimeError::Connection("data channel closed".to_string()))
    }
}

#[async_trait]
impl RealtimeAdapter for MediaTrackAdapter {
    fn provider(&self) -> Provider {
        Provider::WebRtc
    }

    async fn connect(
        &mut self,
        config: &ConnectionConfig,
        ctx: AdapterContext,
    ) -> RealtimeResult<()> {
        match self.establish(config, &ctx).await {
            Ok(()) => {
                info!(model = %config.model, voice = %config.voice, "Media-track negotiation complete");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Media-track connect failed, releasing peer");
                self.teardown().await;
                Err(match e {
                    RealtimeError::Timeout(_) | RealtimeError::Connection(_) => e,
                    other => RealtimeError::Connection(other.to_string()),
                })
            }
        }
    }

    async fn disconnect(&mut self) -> bool {
        self.teardown().await
    }

    async fn send_audio(&mut self, pcm16: Bytes) -> RealtimeResult<()> {
        let link = self.link.as_mut().ok_or(RealtimeError::NotConnected)?;
        link.write_audio(pcm16).await
    }

    async fn send_text(&mut self, text: &str) -> RealtimeResult<()> {
        self.send_control(&ClientEvent::user_text(text))?;
        self.send_control(&ClientEvent::ResponseCreate)
    }

    async fn send_tool_response(&mut self, response: &ToolResponse) -> RealtimeResult<()> {
        self.send_control(&ClientEvent::tool_output(response))?;
        self.send_control(&ClientEvent::ResponseCreate)
    }

    async fn update_config(&mut self, config: &ConnectionConfig) -> RealtimeResult<()> {
        self.send_control(&ClientEvent::session_update(config))?;
        self.turn_detection = config.extras.turn_detection.clone();
        Ok(())
    }

    async fn end_turn(&mut self) -> RealtimeResult<()> {
        self.send_control(&ClientEvent::InputAudioBufferCommit)?;
        self.send_control(&ClientEvent::ResponseCreate)
    }

    fn requires_explicit_end_of_turn(&self) -> bool {
        matches!(self.turn_detection, TurnDetection::Manual)
    }

    fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy::Immediate
    }
}

async fn route_remote_audio(mut remote_audio: mpsc::UnboundedReceiver<Bytes>, ctx: AdapterContext) {
    while let Some(chunk) = remote_audio.recv().await {
        ctx.playback.enqueue(&chunk);
    }
    debug!("Remote audio track ended");
}

/// Sends the initial `session.update` once the channel is open, then maps
/// inbound control messages.
async fn run_control_channel(
    mut inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    outbound: mpsc::UnboundedSender<String>,
    session_update: ClientEvent,
    ctx: AdapterContext,
) {
    let mut session_update = Some(session_update);
    while let Some(event) = inbound.recv().await {
        match event {
            ChannelEvent::Open => {
                let Some(update) = session_update.take() else {
                    continue;
                };
                match update.to_json() {
                    Ok(json) => match outbound.send(json) {
                        Ok(()) => {
                            info!("Data channel open, session configured");
                            ctx.emit(RealtimeEvent::SetupComplete);
                        }
                        Err(_) => warn!("Data channel closed before session.update was sent"),
                    },
                    Err(e) => warn!(error = %e, "Failed to encode session.update"),
                }
            }
            ChannelEvent::Message(text) => forward(&ctx, &text),
            ChannelEvent::Closed => {
                ctx.emit(RealtimeEvent::Close(CloseReason::Remote(Some(
                    "data channel closed".to_string(),
                ))));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{NullSink, PlaybackQueue};
    use serde_json::Value;
    use std::sync::Mutex;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct LinkLog {
        written: Mutex<Vec<Bytes>>,
        closed: Mutex<usize>,
        remote: Mutex<Option<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<ChannelEvent>)>>,
    }

    struct FakeLink {
        log: Arc<LinkLog>,
    }

    #[async_trait]
    impl PeerLink for FakeLink {
        async fn attach_microphone(&mut self, sample_rate: u32) -> RealtimeResult<()> {
            assert_eq!(sample_rate, 24000);
            Ok(())
        }

        async fn open_data_channel(&mut self, label: &str) -> RealtimeResult<DataChannel> {
            assert_eq!(label, DATA_CHANNEL_LABEL);
            let (outbound, sent) = mpsc::unbounded_channel();
            let (events, inbound) = mpsc::unbounded_channel();
            *self.log.remote.lock().unwrap() = Some((sent, events));
            Ok(DataChannel { outbound, inbound })
        }

        async fn create_offer(&mut self) -> RealtimeResult<String> {
            Ok("v=0 offer".to_string())
        }

        async fn accept_answer(&mut self, sdp: String) -> RealtimeResult<()> {
            assert_eq!(sdp, "v=0 answer");
            Ok(())
        }

        fn take_remote_audio(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
            None
        }

        async fn write_audio(&mut self, pcm16: Bytes) -> RealtimeResult<()> {
            self.log.written.lock().unwrap().push(pcm16);
            Ok(())
        }

        async fn close(&mut self) {
            *self.log.closed.lock().unwrap() += 1;
        }
    }

    struct FakeConnector {
        log: Arc<LinkLog>,
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn create(&self) -> RealtimeResult<Box<dyn PeerLink>> {
            Ok(Box::new(FakeLink {
                log: self.log.clone(),
            }))
        }
    }

    async fn mock_backend(answer: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realtime/sessions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "client_secret": { "value": "ek-123", "expires_at": 0 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/realtime"))
            .and(query_param("model", "gpt-4o-realtime-preview-2024-12-17"))
            .and(header("authorization", "Bearer ek-123"))
            .and(header("content-type", "application/sdp"))
            .and(body_string("v=0 offer"))
            .respond_with(answer)
            .mount(&server)
            .await;
        server
    }

    fn adapter(server: &MockServer, log: Arc<LinkLog>) -> MediaTrackAdapter {
        MediaTrackAdapter::new(
            Signalling::new(server.uri(), Arc::new(SecretString::from("sk-test".to_string()))),
            Arc::new(FakeConnector { log }),
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

    #[tokio::test]
    async fn test_session_update_waits_for_channel_open() {
        let server = mock_backend(
            ResponseTemplate::new(201).set_body_raw("v=0 answer", "application/sdp"),
        )
        .await;
        let log = Arc::new(LinkLog::default());
        let mut adapter = adapter(&server, log.clone());
        let (ctx, mut events) = context();

        adapter
            .connect(&ConnectionConfig::defaults_for(Provider::WebRtc), ctx)
            .await
            .unwrap();
        assert!(!adapter.requires_explicit_end_of_turn());
        assert_eq!(adapter.delivery_policy(), DeliveryPolicy::Immediate);

        let (mut sent, channel) = log.remote.lock().unwrap().take().unwrap();
        assert!(sent.try_recv().is_err());

        channel.send(ChannelEvent::Open).unwrap();
        assert_eq!(events.recv().await, Some(RealtimeEvent::SetupComplete));
        let update: Value = serde_json::from_str(&sent.recv().await.unwrap()).unwrap();
        assert_eq!(update["type"], "session.update");
        assert_eq!(update["session"]["voice"], "verse");
    }

    #[tokio::test]
    async fn test_no_setup_complete_when_the_channel_is_gone() {
        let (outbound, sent) = mpsc::unbounded_channel();
        drop(sent);
        let (channel, inbound) = mpsc::unbounded_channel();
        channel.send(ChannelEvent::Open).unwrap();
        channel.send(ChannelEvent::Closed).unwrap();
        let (ctx, mut events) = context();

        let update = ClientEvent::session_update(&ConnectionConfig::defaults_for(Provider::WebRtc));
        run_control_channel(inbound, outbound, update, ctx).await;

        assert!(matches!(
            events.recv().await,
            Some(RealtimeEvent::Close(CloseReason::Remote(_)))
        ));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_audio_goes_to_the_track_not_the_channel() {
        let server = mock_backend(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({ "type": "answer", "sdp": "v=0 answer" }),
        ))
        .await;
        let log = Arc::new(LinkLog::default());
        let mut adapter = adapter(&server, log.clone());
        let (ctx, _events) = context();
        adapter
            .connect(&ConnectionConfig::defaults_for(Provider::WebRtc), ctx)
            .await
            .unwrap();

        adapter.send_audio(Bytes::from_static(&[1, 0])).await.unwrap();
        adapter.send_text("hi").await.unwrap();

        assert_eq!(log.written.lock().unwrap().len(), 1);
        let (mut sent, _channel) = log.remote.lock().unwrap().take().unwrap();
        let first: Value = serde_json::from_str(&sent.recv().await.unwrap()).unwrap();
        let second: Value = serde_json::from_str(&sent.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "conversation.item.create");
        assert_eq!(second["type"], "response.create");

        assert!(adapter.disconnect().await);
        assert!(!adapter.disconnect().await);
        assert_eq!(*log.closed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_signalling_failure_closes_the_peer() {
        let server = mock_backend(ResponseTemplate::new(502)).await;
        let log = Arc::new(LinkLog::default());
        let mut adapter = adapter(&server, log.clone());
        let (ctx, _events) = context();

        let err = adapter
            .connect(&ConnectionConfig::defaults_for(Provider::WebRtc), ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, RealtimeError::Connection(_)));
        assert_eq!(*log.closed.lock().unwrap(), 1);
        assert!(!adapter.disconnect().await);
    }
}
