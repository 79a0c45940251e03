//! The JSON event vocabulary spoken over the data channel and the message stream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    audio::pcm,
    config::{ConnectionConfig, TurnDetection},
    error::{RealtimeError, RealtimeResult},
    events::{ContentKind, ContentPayload, RealtimeEvent, ToolCall, ToolResponse},
};

/// A function the assistant may call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetectionConfig {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionConfig {
    pub model: String,
    pub modalities: Vec<String>,
    pub voice: String,
    pub instructions: String,
    pub input_audio_format: &'static str,
    pub output_audio_format: &'static str,
    /// `null` on the wire turns server-side turn detection off.
    pub turn_detection: Option<TurnDetectionConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl From<&ConnectionConfig> for SessionConfig {
    fn from(config: &ConnectionConfig) -> Self {
        let turn_detection = match config.extras.turn_detection {
            TurnDetection::Manual => None,
            TurnDetection::ServerVad {
                threshold,
                prefix_padding_ms,
                silence_duration_ms,
            } => Some(TurnDetectionConfig::ServerVad {
                threshold,
                prefix_padding_ms,
                silence_duration_ms,
            }),
        };
        Self {
            model: config.model.clone(),
            modalities: config.extras.modalities.clone(),
            voice: config.voice.clone(),
            instructions: config.instructions.clone(),
            input_audio_format: "pcm16",
            output_audio_format: "pcm16",
            turn_detection,
            tools: config.extras.tools.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        role: String,
        content: Vec<ContentPart>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

/// Messages sent to the backend.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    pub fn session_update(config: &ConnectionConfig) -> Self {
        ClientEvent::SessionUpdate {
            session: SessionConfig::from(config),
        }
    }

    pub fn audio_append(pcm16: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: pcm::encode_bytes(pcm16),
        }
    }

    pub fn user_text(text: &str) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::Message {
                role: "user".to_string(),
                content: vec![ContentPart::InputText {
                    text: text.to_string(),
                }],
            },
        }
    }

    pub fn tool_output(response: &ToolResponse) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: response.call_id.clone(),
                output: response.output.to_string(),
            },
        }
    }

    pub fn to_json(&self) -> RealtimeResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

/// Messages received from the backend. Anything unlisted lands in `Unknown`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
    #[serde(rename = "response.text.delta")]
    ResponseTextDelta { delta: String },
    #[serde(rename = "response.text.done")]
    ResponseTextDone { text: String },
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta { delta: String },
    #[serde(rename = "response.audio_transcript.done")]
    ResponseAudioTranscriptDone { transcript: String },
    #[serde(rename = "response.function_call_arguments.done")]
    ResponseFunctionCallArgumentsDone {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "response.cancelled")]
    ResponseCancelled,
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn parse(text: &str) -> RealtimeResult<Self> {
        serde_json::from_str(text).map_err(|e| RealtimeError::Protocol(e.to_string()))
    }

    /// Maps a backend message onto the canonical vocabulary.
    ///
    /// `Ok(None)` means the message is internal and is not forwarded.
    pub fn into_canonical(self) -> RealtimeResult<Option<RealtimeEvent>> {
        let event = match self {
            ServerEvent::SessionCreated | ServerEvent::SessionUpdated | ServerEvent::Unknown => {
                return Ok(None);
            }
            ServerEvent::ResponseAudioDelta { delta } => {
                let audio = pcm::decode_bytes(&delta)?;
                RealtimeEvent::Audio(Bytes::from(audio))
            }
            ServerEvent::ResponseTextDelta { delta } => content(ContentKind::Text, delta, false),
            ServerEvent::ResponseTextDone { text } => content(ContentKind::Text, text, true),
            ServerEvent::ResponseAudioTranscriptDelta { delta } => {
                content(ContentKind::Transcript, delta, false)
            }
            ServerEvent::ResponseAudioTranscriptDone { transcript } => {
                content(ContentKind::Transcript, transcript, true)
            }
            ServerEvent::ResponseFunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => RealtimeEvent::ToolCall(ToolCall {
                call_id,
                name,
                arguments,
            }),
            ServerEvent::ResponseDone => RealtimeEvent::TurnComplete,
            ServerEvent::ResponseCancelled | ServerEvent::SpeechStarted => {
                RealtimeEvent::Interrupted
            }
            ServerEvent::Error { error } => RealtimeEvent::Error(error.message),
        };
        Ok(Some(event))
    }
}

fn content(kind: ContentKind, text: String, done: bool) -> RealtimeEvent {
    RealtimeEvent::Content(ContentPayload { kind, text, done })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Provider;
    use serde_json::json;

    #[test]
    fn test_session_update_shape() {
        let config = ConnectionConfig::defaults_for(Provider::WebSocket).with_instructions("Be brief.");
        let value: Value =
            serde_json::from_str(&ClientEvent::session_update(&config).to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["voice"], "alloy");
        assert_eq!(value["session"]["instructions"], "Be brief.");
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
        assert!(value["session"]["turn_detection"].is_null());
        assert!(value["session"].get("tools").is_none());
    }

    #[test]
    fn test_server_vad_serialization() {
        let config = ConnectionConfig::defaults_for(Provider::WebRtc);
        let value = serde_json::to_value(ClientEvent::session_update(&config)).unwrap();
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["turn_detection"]["silence_duration_ms"], 500);
    }

    #[test]
    fn test_text_turn_messages() {
        let item = serde_json::to_value(ClientEvent::user_text("hello")).unwrap();
        assert_eq!(
            item,
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "user",
                    "content": [{ "type": "input_text", "text": "hello" }]
                }
            })
        );
        let trigger = serde_json::to_value(ClientEvent::ResponseCreate).unwrap();
        assert_eq!(trigger, json!({ "type": "response.create" }));
    }

    #[test]
    fn test_tool_output_is_stringified() {
        let response = ToolResponse {
            call_id: "call_1".to_string(),
            output: json!({ "temperature": 21 }),
        };
        let value = serde_json::to_value(ClientEvent::tool_output(&response)).unwrap();
        assert_eq!(value["item"]["type"], "function_call_output");
        assert_eq!(value["item"]["output"], "{\"temperature\":21}");
    }

    #[test]
    fn test_inbound_mapping() {
        let delta = ServerEvent::parse(r#"{"type":"response.audio.delta","delta":"AAABAA==","item_id":"x"}"#)
            .unwrap()
            .into_canonical()
            .unwrap();
        assert_eq!(
            delta,
            Some(RealtimeEvent::Audio(Bytes::from_static(&[0, 0, 1, 0])))
        );

        let done = ServerEvent::parse(r#"{"type":"response.done","response":{}}"#).unwrap();
        assert_eq!(done.into_canonical().unwrap(), Some(RealtimeEvent::TurnComplete));

        let text = ServerEvent::parse(r#"{"type":"response.text.done","text":"hi"}"#).unwrap();
        assert_eq!(
            text.into_canonical().unwrap(),
            Some(RealtimeEvent::Content(ContentPayload {
                kind: ContentKind::Text,
                text: "hi".to_string(),
                done: true,
            }))
        );

        let call = ServerEvent::parse(
            r#"{"type":"response.function_call_arguments.done","call_id":"c","name":"lookup","arguments":"{}"}"#,
        )
        .unwrap();
        assert!(matches!(
            call.into_canonical().unwrap(),
            Some(RealtimeEvent::ToolCall(ToolCall { ref name, .. })) if name == "lookup"
        ));

        let error = ServerEvent::parse(r#"{"type":"error","error":{"message":"bad","type":"invalid_request_error"}}"#)
            .unwrap();
        assert_eq!(
            error.into_canonical().unwrap(),
            Some(RealtimeEvent::Error("bad".to_string()))
        );
    }

    #[test]
    fn test_internal_and_unknown_events_are_not_forwarded() {
        for raw in [
            r#"{"type":"session.created","session":{}}"#,
            r#"{"type":"session.updated","session":{}}"#,
            r#"{"type":"rate_limits.updated","rate_limits":[]}"#,
        ] {
            let event = ServerEvent::parse(raw).unwrap();
            assert_eq!(event.into_canonical().unwrap(), None);
        }
    }

    #[test]
    fn test_malformed_inbound_is_protocol_error() {
        assert!(matches!(
            ServerEvent::parse("{not json"),
            Err(RealtimeError::Protocol(_))
        ));
        assert!(matches!(
            ServerEvent::parse(r#"{"type":"response.audio.delta"}"#),
            Err(RealtimeError::Protocol(_))
        ));
    }
}
