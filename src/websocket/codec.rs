//! WebSocket Frame Codec
//!
//! Server side framing: client frames must be masked, server frames never
//! are. Fragmented data messages are reassembled before they are yielded.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::deflate::PerMessageDeflate;
use super::message::{
    CloseFrame, Message, CLOSE_INVALID_PAYLOAD, CLOSE_PROTOCOL_ERROR, CLOSE_TOO_BIG,
};

const FIN: u8 = 0x80;
const RSV1: u8 = 0x40;
const RSV2_RSV3: u8 = 0x30;
const MASKED: u8 = 0x80;
const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// A protocol violation by the client, with the close code it maps to
#[derive(Debug)]
pub struct ProtocolViolation {
    pub code: u16,
    pub reason: &'static str,
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (close code {})", self.reason, self.code)
    }
}

impl std::error::Error for ProtocolViolation {}

fn violation(code: u16, reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, ProtocolViolation { code, reason })
}

/// Close frame to send for a decoding error, if it was a protocol violation
pub fn close_frame_for(error: &io::Error) -> Option<CloseFrame> {
    error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<ProtocolViolation>())
        .map(|v| CloseFrame::new(v.code, v.reason))
}

/// Data message being reassembled from fragments
struct Fragmented {
    opcode: OpCode,
    compressed: bool,
    data: Vec<u8>,
}

/// Decodes client frames into [`Message`]s and encodes server frames
pub struct FrameCodec {
    deflate: Option<PerMessageDeflate>,
    max_message_size: usize,
    fragmented: Option<Fragmented>,
}

impl FrameCodec {
    /// Create a codec; `deflate` is set when `permessage-deflate` was negotiated
    pub fn new(deflate: Option<PerMessageDeflate>, max_message_size: usize) -> Self {
        Self {
            deflate,
            max_message_size,
            fragmented: None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.deflate.is_some()
    }

    fn finish(&mut self, opcode: OpCode, compressed: bool, data: Vec<u8>) -> io::Result<Message> {
        let data = if compressed {
            match self.deflate.as_mut() {
                Some(deflate) => deflate
                    .decompress(&data, self.max_message_size)
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::InvalidInput => violation(CLOSE_TOO_BIG, "Message too large"),
                        _ => violation(CLOSE_INVALID_PAYLOAD, "Unable to inflate message"),
                    })?,
                None => return Err(violation(CLOSE_PROTOCOL_ERROR, "Compressed frame without extension")),
            }
        } else {
            data
        };

        match opcode {
            OpCode::Text => String::from_utf8(data)
                .map(Message::Text)
                .map_err(|_| violation(CLOSE_INVALID_PAYLOAD, "Text message is not UTF-8")),
            _ => Ok(Message::Binary(data)),
        }
    }
}

/// Parsed frame header
struct Header {
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    mask: [u8; 4],
    header_len: usize,
    payload_len: usize,
}

fn parse_header(src: &[u8]) -> io::Result<Option<Header>> {
    if src.len() < 2 {
        return Ok(None);
    }

    let first = src[0];
    let second = src[1];

    if first & RSV2_RSV3 != 0 {
        return Err(violation(CLOSE_PROTOCOL_ERROR, "Reserved bits set"));
    }
    let opcode = OpCode::from_bits(first & 0x0F)
        .ok_or_else(|| violation(CLOSE_PROTOCOL_ERROR, "Unknown opcode"))?;
    if second & MASKED == 0 {
        return Err(violation(CLOSE_PROTOCOL_ERROR, "Client frame is not masked"));
    }

    let (extended, payload_len) = match second & 0x7F {
        126 => {
            if src.len() < 4 {
                return Ok(None);
            }
            (2, u16::from_be_bytes([src[2], src[3]]) as u64)
        }
        127 => {
            if src.len() < 10 {
                return Ok(None);
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&src[2..10]);
            (8, u64::from_be_bytes(len))
        }
        len => (0, len as u64),
    };

    let header_len = 2 + extended + 4;
    if src.len() < header_len {
        return Ok(None);
    }
    let payload_len = usize::try_from(payload_len)
        .map_err(|_| violation(CLOSE_TOO_BIG, "Frame too large"))?;

    let mut mask = [0u8; 4];
    mask.copy_from_slice(&src[header_len - 4..header_len]);

    Ok(Some(Header {
        fin: first & FIN != 0,
        rsv1: first & RSV1 != 0,
        opcode,
        mask,
        header_len,
        payload_len,
    }))
}

fn unmask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

fn parse_close(payload: &[u8]) -> io::Result<Option<CloseFrame>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(violation(CLOSE_PROTOCOL_ERROR, "Close frame with a one byte payload")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| violation(CLOSE_INVALID_PAYLOAD, "Close reason is not UTF-8"))?;
            Ok(Some(CloseFrame::new(code, reason)))
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Message>> {
        loop {
            let header = match parse_header(src)? {
                Some(header) => header,
                None => return Ok(None),
            };

            if header.opcode.is_control() {
                if !header.fin {
                    return Err(violation(CLOSE_PROTOCOL_ERROR, "Fragmented control frame"));
                }
                if header.payload_len > MAX_CONTROL_PAYLOAD {
                    return Err(violation(CLOSE_PROTOCOL_ERROR, "Control frame too large"));
                }
            }
            if header.rsv1
                && (self.deflate.is_none() || header.opcode.is_control() || header.opcode == OpCode::Continuation)
            {
                return Err(violation(CLOSE_PROTOCOL_ERROR, "Unexpected compression bit"));
            }

            let buffered = self.fragmented.as_ref().map_or(0, |f| f.data.len());
            if buffered.saturating_add(header.payload_len) > self.max_message_size {
                return Err(violation(CLOSE_TOO_BIG, "Message too large"));
            }

            let frame_len = header.header_len + header.payload_len;
            if src.len() < frame_len {
                src.reserve(frame_len - src.len());
                return Ok(None);
            }

            src.advance(header.header_len);
            let mut payload = src.split_to(header.payload_len).to_vec();
            unmask(&mut payload, header.mask);

            match header.opcode {
                OpCode::Ping => return Ok(Some(Message::Ping(payload))),
                OpCode::Pong => return Ok(Some(Message::Pong(payload))),
                OpCode::Close => return parse_close(&payload).map(|frame| Some(Message::Close(frame))),
                OpCode::Continuation => {
                    let mut fragmented = self
                        .fragmented
                        .take()
                        .ok_or_else(|| violation(CLOSE_PROTOCOL_ERROR, "Continuation without a message"))?;
                    fragmented.data.extend_from_slice(&payload);
                    if header.fin {
                        return self
                            .finish(fragmented.opcode, fragmented.compressed, fragmented.data)
                            .map(Some);
                    }
                    self.fragmented = Some(fragmented);
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragmented.is_some() {
                        return Err(violation(CLOSE_PROTOCOL_ERROR, "New message inside a fragmented one"));
                    }
                    if header.fin {
                        return self.finish(header.opcode, header.rsv1, payload).map(Some);
                    }
                    self.fragmented = Some(Fragmented {
                        opcode: header.opcode,
                        compressed: header.rsv1,
                        data: payload,
                    });
                }
            }
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> io::Result<()> {
        let (opcode, payload) = match message {
            Message::Text(text) => (OpCode::Text, text.into_bytes()),
            Message::Binary(data) => (OpCode::Binary, data),
            Message::Ping(data) => (OpCode::Ping, data),
            Message::Pong(data) => (OpCode::Pong, data),
            Message::Close(None) => (OpCode::Close, Vec::new()),
            Message::Close(Some(frame)) => {
                let mut data = Vec::with_capacity(2 + frame.reason.len());
                data.extend_from_slice(&frame.code.to_be_bytes());
                data.extend_from_slice(frame.reason.as_bytes());
                (OpCode::Close, data)
            }
        };

        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "control frame payload exceeds 125 bytes",
            ));
        }

        let (payload, rsv1) = match self.deflate.as_mut() {
            Some(deflate) if !opcode.is_control() => (deflate.compress(&payload)?, RSV1),
            _ => (payload, 0),
        };

        dst.reserve(payload.len() + 10);
        dst.put_u8(FIN | rsv1 | opcode.bits());
        match payload.len() {
            len if len < 126 => dst.put_u8(len as u8),
            len if len <= u16::MAX as usize => {
                dst.put_u8(126);
                dst.put_u16(len as u16);
            }
            len => {
                dst.put_u8(127);
                dst.put_u64(len as u64);
            }
        }
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
