//! A [`PeerConnector`] on top of the `webrtc` crate.
//!
//! The session boundary speaks PCM16 at 24 kHz; the media track carries Opus,
//! so this module transcodes in both directions with `audiopus`.

use async_trait::async_trait;
use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, MutSignals, SampleRate};
use bytes::Bytes;
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MediaEngine};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::media_track::{ChannelEvent, DataChannel, PeerConnector, PeerLink};
use crate::audio::{PCM16_SAMPLE_RATE, pcm};
use crate::error::{RealtimeError, RealtimeResult};

/// 20 ms at 24 kHz mono.
const OPUS_FRAME_SAMPLES: usize = 480;
const OPUS_FRAME_DURATION: Duration = Duration::from_millis(20);
const MAX_OPUS_FRAME_BYTES: usize = 4000;
/// 120 ms at 24 kHz, the longest Opus frame.
const MAX_DECODED_SAMPLES: usize = 2880;

fn peer_error(e: webrtc::Error) -> RealtimeError {
    RealtimeError::Connection(format!("WebRTC error: {}", e))
}

fn opus_error(e: audiopus::Error) -> RealtimeError {
    RealtimeError::Media(format!("Opus codec error: {}", e))
}

fn opus_rate() -> RealtimeResult<SampleRate> {
    SampleRate::try_from(PCM16_SAMPLE_RATE as i32).map_err(opus_error)
}

/// Creates `webrtc` peer connections.
#[derive(Clone, Debug)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    /// STUN/TURN urls offered to the peer connection, see `REALTIME_ICE_SERVERS`.
    pub fn with_ice_servers(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create(&self) -> RealtimeResult<Box<dyn PeerLink>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(peer_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(peer_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(peer_error)?);

        pc.on_peer_connection_state_change(Box::new(|state| {
            info!(state = %state, "Peer connection state changed");
            Box::pin(async {})
        }));

        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let audio_tx = audio_tx.clone();
            Box::pin(async move {
                if track.kind() == RTPCodecType::Audio {
                    info!(codec = %track.codec().capability.mime_type, "Remote audio track received");
                    tokio::spawn(read_remote_track(track, audio_tx));
                }
            })
        }));

        Ok(Box::new(WebRtcLink {
            pc,
            local_track: None,
            encoder: None,
            pending: Vec::new(),
            remote_audio: Some(audio_rx),
        }))
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    local_track: Option<Arc<TrackLocalStaticSample>>,
    encoder: Option<Encoder>,
    /// Samples waiting for a full Opus frame.
    pending: Vec<i16>,
    remote_audio: Option<mpsc::UnboundedReceiver<Bytes>>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn attach_microphone(&mut self, sample_rate: u32) -> RealtimeResult<()> {
        if sample_rate != PCM16_SAMPLE_RATE {
            return Err(RealtimeError::Media(format!(
                "unsupported capture rate {}",
                sample_rate
            )));
        }
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "voxbridge".to_owned(),
        ));
        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(peer_error)?;
        self.encoder = Some(
            Encoder::new(opus_rate()?, Channels::Mono, Application::Voip).map_err(opus_error)?,
        );
        self.local_track = Some(track);
        Ok(())
    }

    async fn open_data_channel(&mut self, label: &str) -> RealtimeResult<DataChannel> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(peer_error)?;

        let (events_tx, inbound) = mpsc::unbounded_channel();
        let (opened_tx, mut opened_rx) = watch::channel(false);

        let on_open = events_tx.clone();
        dc.on_open(Box::new(move || {
            let _ = opened_tx.send(true);
            let _ = on_open.send(ChannelEvent::Open);
            Box::pin(async {})
        }));
        let on_message = events_tx.clone();
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    let _ = on_message.send(ChannelEvent::Message(text));
                }
                Err(_) => warn!("Dropping non UTF-8 data channel message"),
            }
            Box::pin(async {})
        }));
        dc.on_close(Box::new(move || {
            let _ = events_tx.send(ChannelEvent::Closed);
            Box::pin(async {})
        }));

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            if opened_rx.wait_for(|open| *open).await.is_err() {
                return;
            }
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = dc.send_text(text).await {
                    warn!(error = %e, "Failed to write to data channel");
                    break;
                }
            }
            debug!("Data channel writer finished");
        });

        Ok(DataChannel { outbound, inbound })
    }

    async fn create_offer(&mut self) -> RealtimeResult<String> {
        let offer = self.pc.create_offer(None).await.map_err(peer_error)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(peer_error)?;
        let _ = gathered.recv().await;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| RealtimeError::Connection("no local description".to_string()))?;
        Ok(local.sdp)
    }

    async fn accept_answer(&mut self, sdp: String) -> RealtimeResult<()> {
        let answer = RTCSessionDescription::answer(sdp).map_err(peer_error)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(peer_error)
    }

    fn take_remote_audio(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.remote_audio.take()
    }

    async fn write_audio(&mut self, pcm16: Bytes) -> RealtimeResult<()> {
        let (Some(track), Some(encoder)) = (self.local_track.as_ref(), self.encoder.as_mut())
        else {
            return Err(RealtimeError::NotConnected);
        };

        self.pending.extend(pcm::from_le_bytes(&pcm16));
        let whole = self.pending.len() / OPUS_FRAME_SAMPLES * OPUS_FRAME_SAMPLES;
        let frames: Vec<i16> = self.pending.drain(..whole).collect();

        let mut packet = vec![0u8; MAX_OPUS_FRAME_BYTES];
        for frame in frames.chunks_exact(OPUS_FRAME_SAMPLES) {
            let len = encoder.encode(frame, &mut packet).map_err(opus_error)?;
            track
                .write_sample(&Sample {
                    data: Bytes::copy_from_slice(&packet[..len]),
                    duration: OPUS_FRAME_DURATION,
                    ..Default::default()
                })
                .await
                .map_err(peer_error)?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Error while closing peer connection");
        }
        self.local_track = None;
        self.encoder = None;
        self.pending.clear();
    }
}

async fn read_remote_track(track: Arc<TrackRemote>, audio_tx: mpsc::UnboundedSender<Bytes>) {
    let mut decoder = match opus_rate().and_then(|rate| {
        Decoder::new(rate, Channels::Mono).map_err(opus_error)
    }) {
        Ok(decoder) => decoder,
        Err(e) => {
            warn!(error = %e, "Cannot decode remote audio");
            return;
        }
    };
    let mut output = vec![0i16; MAX_DECODED_SAMPLES];

    loop {
        let (packet, _) = match track.read_rtp().await {
            Ok(read) => read,
            Err(e) => {
                debug!(error = %e, "Remote track read ended");
                break;
            }
        };
        if packet.payload.is_empty() {
            continue;
        }
        let decoded = audiopus::packet::Packet::try_from(&packet.payload[..])
            .and_then(|opus| {
                let signals = MutSignals::try_from(output.as_mut_slice())?;
                decoder.decode(Some(opus), signals, false)
            });
        match decoded {
            Ok(samples) => {
                let chunk = Bytes::from(pcm::to_le_bytes(&output[..samples]));
                if audio_tx.send(chunk).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Dropping undecodable Opus packet"),
        }
    }
}
