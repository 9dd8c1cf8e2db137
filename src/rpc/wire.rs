//! RPC frame header.
//!
//! A 16-byte header precedes every message in either direction. All
//! fields are little-endian on the wire and converted exactly once on
//! ingress and once on egress; core logic only ever sees host order.

/// Maximum body bytes per message.
pub const MAX_MSG_SIZE: usize = 65536;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Wire status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    /// Request (always 0) or successful response.
    Success = 0,
    /// The service could not process the request.
    ServiceFailed = 1,
}

/// The frame header carried before every message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Status code: 0 in requests, response code otherwise.
    pub status: u32,
    /// Server-side method table ordinal.
    pub method_index: u32,
    /// Body length in bytes.
    pub message_length: u32,
    /// Client-chosen identifier, echoed by the server.
    pub request_id: u32,
}

impl FrameHeader {
    /// Builds a request header.
    pub fn request(method_index: u32, message_length: u32, request_id: u32) -> Self {
        Self {
            status: StatusCode::Success as u32,
            method_index,
            message_length,
            request_id,
        }
    }

    /// Builds a response header echoing the request identity.
    pub fn response(status: StatusCode, method_index: u32, message_length: u32, request_id: u32) -> Self {
        Self {
            status: status as u32,
            method_index,
            message_length,
            request_id,
        }
    }

    /// Encodes the header into its little-endian wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.status.to_le_bytes());
        out[4..8].copy_from_slice(&self.method_index.to_le_bytes());
        out[8..12].copy_from_slice(&self.message_length.to_le_bytes());
        out[12..16].copy_from_slice(&self.request_id.to_le_bytes());
        out
    }

    /// Decodes a header from `HEADER_SIZE` wire bytes.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_SIZE`]; callers read the
    /// full header before decoding.
    pub fn decode(buf: &[u8]) -> Self {
        let field = |i: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[i * 4..i * 4 + 4]);
            u32::from_le_bytes(bytes)
        };

        Self {
            status: field(0),
            method_index: field(1),
            message_length: field(2),
            request_id: field(3),
        }
    }
}
