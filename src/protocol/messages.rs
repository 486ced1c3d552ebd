//! # Control Messages
//!
//! JSON text frames exchanged with clients.
//!
//! ## Client → Server:
//! - `{"type": "end"}`: the current audio segment is complete (flush)
//! - `{"type": "interrupt"}`: cancel in-flight output
//! - `{"type": "control", "data": {"command": "subscribe", "params": {"video": bool, "audio": bool}}}`
//! - `{"command": "subscribe", "params": {...}}`: same as above without the wrapper
//! - `{"type": "audio_input", "data": "<base64 int16 LE PCM>", "sample_rate": 16000}`
//!
//! Every accepted shape is mapped onto the closed [`ClientCommand`] enum, so
//! handlers match exhaustively and an unrecognized command shows up as
//! [`ClientCommand::Unknown`] instead of falling through silently.
//!
//! ## Server → Client:
//! [`ServerMessage`]: the welcome, status acknowledgements and error notices.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AppConfig;
use crate::error::{RelayError, RelayResult};

/// A decoded client text message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// Flush the current segment
    End,
    /// Cancel the current segment
    Interrupt,
    /// Change which media kinds this client receives; `None` leaves a flag unchanged
    Subscribe { video: Option<bool>, audio: Option<bool> },
    /// Base64 PCM delivered inside JSON instead of a binary frame
    AudioInput { pcm: Vec<u8>, sample_rate: Option<u32> },
    /// Well-formed JSON naming a command the relay does not know
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    command: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    data: Value,
    sample_rate: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeParams {
    video: Option<bool>,
    audio: Option<bool>,
}

impl ClientCommand {
    /// Parse a text frame.
    ///
    /// Malformed JSON and structurally invalid messages are `Protocol` errors;
    /// the caller logs them and carries on.
    pub fn parse(text: &str) -> RelayResult<Self> {
        let raw: RawMessage = serde_json::from_str(text)?;

        if let Some(kind) = raw.kind {
            return match kind.as_str() {
                "end" => Ok(ClientCommand::End),
                "interrupt" => Ok(ClientCommand::Interrupt),
                "control" => {
                    let command = raw
                        .data
                        .get("command")
                        .and_then(Value::as_str)
                        .ok_or_else(|| RelayError::Protocol("control message without command".to_string()))?
                        .to_string();
                    let params = raw.data.get("params").cloned().unwrap_or(Value::Null);
                    Self::from_command(&command, params)
                }
                "audio_input" => {
                    let encoded = raw
                        .data
                        .as_str()
                        .ok_or_else(|| RelayError::Protocol("audio_input data must be a base64 string".to_string()))?;
                    let pcm = BASE64
                        .decode(encoded)
                        .map_err(|e| RelayError::Protocol(format!("invalid base64 audio: {}", e)))?;
                    Ok(ClientCommand::AudioInput {
                        pcm,
                        sample_rate: raw.sample_rate,
                    })
                }
                _ => Ok(ClientCommand::Unknown(kind)),
            };
        }

        match raw.command {
            Some(command) => Self::from_command(&command, raw.params),
            None => Err(RelayError::Protocol(
                "message has neither a type nor a command".to_string(),
            )),
        }
    }

    fn from_command(command: &str, params: Value) -> RelayResult<Self> {
        match command {
            "subscribe" => {
                let params: SubscribeParams = if params.is_null() {
                    SubscribeParams::default()
                } else {
                    serde_json::from_value(params)?
                };
                Ok(ClientCommand::Subscribe {
                    video: params.video,
                    audio: params.audio,
                })
            }
            "end" => Ok(ClientCommand::End),
            "interrupt" => Ok(ClientCommand::Interrupt),
            other => Ok(ClientCommand::Unknown(other.to_string())),
        }
    }
}

/// JSON messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once right after a connection is admitted
    Connected {
        message: String,
        client_id: String,
        audio_format: AudioFormat,
        video_format: VideoFormat,
    },
    Status { data: StatusPayload },
    Error { data: ErrorPayload },
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub encoding: &'static str,
    pub chunk_ms: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoFormat {
    pub codec: &'static str,
    pub fps: f64,
    pub quality: u8,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusPayload {
    Subscribed { client_id: String, video: bool, audio: bool },
    AudioOverflow { dropped_chunks: usize },
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ServerMessage {
    /// The welcome message describing the negotiated formats.
    pub fn welcome(client_id: &str, config: &AppConfig) -> Self {
        ServerMessage::Connected {
            message: "Avatar relay ready".to_string(),
            client_id: client_id.to_string(),
            audio_format: AudioFormat {
                sample_rate: config.audio.sample_rate,
                channels: config.audio.channels,
                encoding: "int16_le",
                chunk_ms: config.audio.chunk_ms,
            },
            video_format: VideoFormat {
                codec: "jpeg",
                fps: config.video.target_fps,
                quality: config.video.jpeg_quality,
            },
        }
    }

    pub fn error(err: &RelayError) -> Self {
        ServerMessage::Error {
            data: ErrorPayload {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these plain structs cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_end_and_interrupt() {
        assert_eq!(ClientCommand::parse(r#"{"type":"end"}"#).unwrap(), ClientCommand::End);
        assert_eq!(
            ClientCommand::parse(r#"{"type":"interrupt"}"#).unwrap(),
            ClientCommand::Interrupt
        );
    }

    #[test]
    fn test_parse_subscribe_both_shapes() {
        let wrapped = r#"{"type":"control","data":{"command":"subscribe","params":{"video":false,"audio":true}}}"#;
        let bare = r#"{"command":"subscribe","params":{"video":false,"audio":true}}"#;
        let expected = ClientCommand::Subscribe {
            video: Some(false),
            audio: Some(true),
        };
        assert_eq!(ClientCommand::parse(wrapped).unwrap(), expected);
        assert_eq!(ClientCommand::parse(bare).unwrap(), expected);
    }

    #[test]
    fn test_parse_partial_subscribe() {
        let cmd = ClientCommand::parse(r#"{"command":"subscribe","params":{"video":false}}"#).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::Subscribe {
                video: Some(false),
                audio: None
            }
        );
    }

    #[test]
    fn test_unknown_commands_are_reported() {
        assert_eq!(
            ClientCommand::parse(r#"{"type":"dance"}"#).unwrap(),
            ClientCommand::Unknown("dance".to_string())
        );
        assert_eq!(
            ClientCommand::parse(r#"{"type":"control","data":{"command":"zoom"}}"#).unwrap(),
            ClientCommand::Unknown("zoom".to_string())
        );
    }

    #[test]
    fn test_malformed_messages_are_protocol_errors() {
        assert!(matches!(ClientCommand::parse("{oops"), Err(RelayError::Protocol(_))));
        assert!(matches!(ClientCommand::parse(r#"{"hello":1}"#), Err(RelayError::Protocol(_))));
        assert!(matches!(
            ClientCommand::parse(r#"{"command":"subscribe","params":{"video":"no"}}"#),
            Err(RelayError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_base64_audio_input() {
        let pcm = vec![1u8, 0, 2, 0];
        let text = format!(
            r#"{{"type":"audio_input","data":"{}","sample_rate":16000}}"#,
            BASE64.encode(&pcm)
        );
        assert_eq!(
            ClientCommand::parse(&text).unwrap(),
            ClientCommand::AudioInput {
                pcm,
                sample_rate: Some(16000)
            }
        );
    }

    #[test]
    fn test_welcome_message_shape() {
        let json = ServerMessage::welcome("client_1", &AppConfig::default()).to_json();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["client_id"], "client_1");
        assert_eq!(value["audio_format"]["sample_rate"], 16000);
        assert_eq!(value["audio_format"]["encoding"], "int16_le");
        assert_eq!(value["video_format"]["codec"], "jpeg");
    }

    #[test]
    fn test_status_message_shape() {
        let msg = ServerMessage::Status {
            data: StatusPayload::Subscribed {
                client_id: "client_2".to_string(),
                video: false,
                audio: true,
            },
        };
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["data"]["status"], "subscribed");
        assert_eq!(value["data"]["video"], false);
    }
}
