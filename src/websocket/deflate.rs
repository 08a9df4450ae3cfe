//! permessage-deflate (RFC 7692)
//!
//! Only the no-context-takeover variant is offered back to clients: every
//! message is compressed and decompressed on its own, so neither side keeps
//! a sliding window between messages.

use std::io;

use axum::http::{header, HeaderMap};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Extension token
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// `Sec-WebSocket-Extensions` value sent when an offer is accepted
pub const ACCEPTED_EXTENSION: &str =
    "permessage-deflate; server_no_context_takeover; client_no_context_takeover";

/// Trailer removed from every compressed message and restored before inflating
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Window size used by both directions
const MAX_WINDOW_BITS: u8 = 15;

/// Whether the client's `Sec-WebSocket-Extensions` headers contain a
/// `permessage-deflate` offer the bridge can accept.
///
/// Offers are tried in order. An offer is declined when it repeats a
/// parameter, carries an unknown one, or asks the server for a window
/// smaller than 15 bits.
pub fn negotiate(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::SEC_WEBSOCKET_EXTENSIONS)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(offer_is_acceptable)
}

fn offer_is_acceptable(offer: &str) -> bool {
    let mut params = offer.split(';').map(str::trim);
    match params.next() {
        Some(name) if name.eq_ignore_ascii_case(EXTENSION_NAME) => {}
        _ => return false,
    }

    let mut seen: Vec<&str> = Vec::new();
    for param in params {
        let (name, value) = match param.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
            None => (param, None),
        };
        if seen.contains(&name) {
            return false;
        }
        seen.push(name);

        let ok = match (name, value) {
            ("server_no_context_takeover", None) | ("client_no_context_takeover", None) => true,
            ("client_max_window_bits", None) => true,
            ("client_max_window_bits", Some(bits)) => window_bits(bits).is_some(),
            ("server_max_window_bits", Some(bits)) => window_bits(bits) == Some(MAX_WINDOW_BITS),
            _ => false,
        };
        if !ok {
            return false;
        }
    }

    true
}

fn window_bits(value: &str) -> Option<u8> {
    value.parse::<u8>().ok().filter(|bits| (8..=15).contains(bits))
}

/// Per-connection compressor and decompressor
pub struct PerMessageDeflate {
    compress: Compress,
    decompress: Decompress,
}

impl PerMessageDeflate {
    pub fn new() -> Self {
        Self {
            compress: Compress::new(Compression::fast(), false),
            decompress: Decompress::new(false),
        }
    }

    /// Compress one message payload
    pub fn compress(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        self.compress.reset();
        let mut output = Vec::with_capacity(input.len() / 2 + 64);

        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(64));
            }
            let consumed = self.compress.total_in() as usize;
            self.compress
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            // A sync flush is complete once all input is taken and the
            // output was not filled to the brim.
            if self.compress.total_in() as usize == input.len() && output.len() < output.capacity() {
                break;
            }
        }

        if output.ends_with(&DEFLATE_TAIL) {
            output.truncate(output.len() - DEFLATE_TAIL.len());
        }
        Ok(output)
    }

    /// Decompress one message payload.
    ///
    /// Fails with `InvalidInput` once the output would grow past `limit`
    /// bytes and with `InvalidData` on a corrupt stream.
    pub fn decompress(&mut self, payload: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        self.decompress.reset(false);

        let mut input = Vec::with_capacity(payload.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(payload);
        input.extend_from_slice(&DEFLATE_TAIL);

        let mut output = Vec::with_capacity(payload.len().saturating_mul(2).clamp(64, limit.max(64)));

        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(64));
            }
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let consumed = before_in as usize;

            let status = self
                .decompress
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            if output.len() > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("decompressed message exceeds {} bytes", limit),
                ));
            }

            let all_in = self.decompress.total_in() as usize == input.len();
            if status == Status::StreamEnd || (all_in && output.len() < output.capacity()) {
                break;
            }

            let stalled = self.decompress.total_in() == before_in
                && self.decompress.total_out() == before_out
                && output.len() < output.capacity();
            if stalled {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "compressed message is truncated or corrupt",
                ));
            }
        }

        Ok(output)
    }
}

impl Default for PerMessageDeflate {
    fn default() -> Self {
        Self::new()
    }
}
