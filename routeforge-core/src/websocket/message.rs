//! WebSocket messages and close information.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::error::{Error, Result};

/// Kind of a complete message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// UTF-8 text.
    Text,
    /// Binary data.
    Binary,
    /// Ping control frame.
    Ping,
    /// Pong control frame.
    Pong,
}

/// A complete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    data: Bytes,
    msg_type: MessageType,
}

impl Message {
    /// A text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(text.into()),
            msg_type: MessageType::Text,
        }
    }

    /// A binary message.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            msg_type: MessageType::Binary,
        }
    }

    /// A ping.
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            msg_type: MessageType::Ping,
        }
    }

    /// A pong.
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            msg_type: MessageType::Pong,
        }
    }

    pub(crate) fn from_parts(msg_type: MessageType, data: Bytes) -> Self {
        Self { data, msg_type }
    }

    /// The message type.
    pub fn message_type(&self) -> MessageType {
        self.msg_type
    }

    /// Whether this is a text message.
    pub fn is_text(&self) -> bool {
        self.msg_type == MessageType::Text
    }

    /// Whether this is a binary message.
    pub fn is_binary(&self) -> bool {
        self.msg_type == MessageType::Binary
    }

    /// The payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The payload as a cheap clone.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// The payload as UTF-8, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// The payload as UTF-8, replacing invalid sequences.
    pub fn to_text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Deserializes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    pub(crate) fn into_tungstenite(self) -> Result<TungsteniteMessage> {
        Ok(match self.msg_type {
            MessageType::Text => {
                let text = String::from_utf8(self.data.to_vec())
                    .map_err(|_| Error::custom("text message is not valid UTF-8"))?;
                TungsteniteMessage::Text(text)
            }
            MessageType::Binary => TungsteniteMessage::Binary(self.data.to_vec()),
            MessageType::Ping => TungsteniteMessage::Ping(self.data.to_vec()),
            MessageType::Pong => TungsteniteMessage::Pong(self.data.to_vec()),
        })
    }
}

/// Status and reason of a closed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close status code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

impl CloseInfo {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// The endpoint is going away.
    pub const GOING_AWAY: u16 = 1001;
    /// No status code was present in the close frame.
    pub const NO_STATUS: u16 = 1005;
    /// The connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
    /// A message exceeded the configured size.
    pub const TOO_BIG: u16 = 1009;

    /// Creates close information.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A normal closure with an empty reason.
    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }

    pub(crate) fn from_frame(frame: Option<CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) => Self::new(u16::from(frame.code), frame.reason.into_owned()),
            None => Self::new(Self::NO_STATUS, ""),
        }
    }

    pub(crate) fn to_frame(&self) -> CloseFrame<'static> {
        CloseFrame {
            code: CloseCode::from(self.code),
            reason: self.reason.clone().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_message() {
        let msg = Message::text("Hello, World!");
        assert!(msg.is_text());
        assert_eq!(msg.as_text(), Some("Hello, World!"));
        assert_eq!(msg.message_type(), MessageType::Text);
    }

    #[test]
    fn test_binary_message() {
        let msg = Message::binary(vec![1, 2, 3]);
        assert!(msg.is_binary());
        assert_eq!(msg.as_bytes(), &[1, 2, 3]);
        assert_eq!(msg.to_text_lossy(), "\u{1}\u{2}\u{3}");
    }

    #[test]
    fn test_json_parsing() {
        let msg = Message::text(r#"{"key":"value","number":42}"#);
        let json: serde_json::Value = msg.json().unwrap();
        assert_eq!(json["number"], 42);
    }

    #[test]
    fn test_into_tungstenite() {
        let text = Message::text("hi").into_tungstenite().unwrap();
        assert_eq!(text, TungsteniteMessage::Text("hi".to_string()));
        let invalid = Message::from_parts(MessageType::Text, Bytes::from_static(&[0xff]));
        assert!(invalid.into_tungstenite().is_err());
    }

    #[test]
    fn test_close_frame_conversion() {
        let info = CloseInfo::new(CloseInfo::GOING_AWAY, "bye");
        let back = CloseInfo::from_frame(Some(info.to_frame()));
        assert_eq!(back, info);
        assert_eq!(CloseInfo::from_frame(None).code, CloseInfo::NO_STATUS);
    }
}
