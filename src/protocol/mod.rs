//! # Wire Protocol
//!
//! - **codec**: binary server → client frames (video, audio, end-of-speech)
//! - **messages**: JSON control messages in both directions
//!
//! Inbound binary frames carry no header at all: the payload is the PCM.
//! Binary and text are told apart by websocket frame type, never by sniffing.

pub mod codec;
pub mod messages;

pub use codec::{encode_audio, encode_end_of_speech, encode_video};
pub use messages::{ClientCommand, ServerMessage, StatusPayload};
