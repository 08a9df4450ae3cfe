//! WebSocket Messages

use std::fmt;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// The peer broke the framing rules
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// A text message was not valid UTF-8
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
/// A message exceeded the configured size limit
pub const CLOSE_TOO_BIG: u16 = 1009;

/// A complete WebSocket message, after reassembly and decompression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseFrame>),
}

/// Status code and reason carried by a close message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}
