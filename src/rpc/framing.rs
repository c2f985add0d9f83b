//! Wire protocol codec for the worklet RPC channel.
//!
//! Length-prefixed frames with a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Every payload starts with a `[u32 LE id]` correlation identifier.
//! Frame types:
//! - `0x01`: Request (caller → handler): `[u32 id][u32 method][body]`
//! - `0x02`: Response (handler → caller): `[u32 id][body]`
//! - `0x03`: Error (handler → caller): `[u32 id][error]`
//! - `0x04`: Subscribe (caller → handler): `[u32 id][u32 method][body]`
//! - `0x05`: Stream data (handler → caller): `[u32 id][body]`
//! - `0x06`: Stream end (handler → caller): `[u32 id]`
//! - `0x07`: Stream error (handler → caller): `[u32 id][error]`
//! - `0x08`: Stream cancel (caller → handler): `[u32 id]`
//!
//! Error payloads are `[u32 LE message_len][message][stack]`, both UTF-8.

use anyhow::{bail, Result};

use super::RemoteError;

/// Maximum frame payload size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame type constants.
pub mod frame_type {
    /// Request/response call.
    pub const REQUEST: u8 = 0x01;
    /// Successful response to a request.
    pub const RESPONSE: u8 = 0x02;
    /// Handler error in response to a request.
    pub const ERROR: u8 = 0x03;
    /// Open a server-push stream.
    pub const SUBSCRIBE: u8 = 0x04;
    /// One stream event.
    pub const STREAM_DATA: u8 = 0x05;
    /// Handler side ended the stream.
    pub const STREAM_END: u8 = 0x06;
    /// Handler side failed the stream.
    pub const STREAM_ERROR: u8 = 0x07;
    /// Subscriber side closed the stream.
    pub const STREAM_CANCEL: u8 = 0x08;
}

/// A decoded frame from the wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Call `method` with an encoded request body.
    Request {
        /// Correlation id chosen by the caller.
        id: u32,
        /// Method slot.
        method: u32,
        /// Encoded request payload.
        body: Vec<u8>,
    },

    /// Encoded result for request `id`.
    Response {
        /// Correlation id of the request.
        id: u32,
        /// Encoded response payload.
        body: Vec<u8>,
    },

    /// Request `id` failed on the remote side.
    Error {
        /// Correlation id of the request.
        id: u32,
        /// Relayed handler error.
        error: RemoteError,
    },

    /// Open stream `id` on `method`.
    Subscribe {
        /// Stream id chosen by the subscriber.
        id: u32,
        /// Method slot.
        method: u32,
        /// Encoded subscribe payload.
        body: Vec<u8>,
    },

    /// One event on stream `id`.
    StreamData {
        /// Stream id.
        id: u32,
        /// Encoded event.
        body: Vec<u8>,
    },

    /// The handler ended stream `id`.
    StreamEnd {
        /// Stream id.
        id: u32,
    },

    /// The handler failed stream `id`.
    StreamError {
        /// Stream id.
        id: u32,
        /// Relayed handler error.
        error: RemoteError,
    },

    /// The subscriber closed stream `id`.
    StreamCancel {
        /// Stream id.
        id: u32,
    },
}

impl Frame {
    /// Correlation id carried by this frame.
    pub fn id(&self) -> u32 {
        match self {
            Frame::Request { id, .. }
            | Frame::Response { id, .. }
            | Frame::Error { id, .. }
            | Frame::Subscribe { id, .. }
            | Frame::StreamData { id, .. }
            | Frame::StreamEnd { id }
            | Frame::StreamError { id, .. }
            | Frame::StreamCancel { id } => *id,
        }
    }

    /// Encode this frame into a wire-format byte vector.
    ///
    /// Returns `[u32 LE length][u8 type][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Request { id, method, body } => {
                encode_raw(frame_type::REQUEST, &call_payload(*id, *method, body))
            }
            Frame::Response { id, body } => {
                encode_raw(frame_type::RESPONSE, &id_payload(*id, body))
            }
            Frame::Error { id, error } => {
                encode_raw(frame_type::ERROR, &id_payload(*id, &encode_error(error)))
            }
            Frame::Subscribe { id, method, body } => {
                encode_raw(frame_type::SUBSCRIBE, &call_payload(*id, *method, body))
            }
            Frame::StreamData { id, body } => {
                encode_raw(frame_type::STREAM_DATA, &id_payload(*id, body))
            }
            Frame::StreamEnd { id } => encode_raw(frame_type::STREAM_END, &id.to_le_bytes()),
            Frame::StreamError { id, error } => {
                encode_raw(frame_type::STREAM_ERROR, &id_payload(*id, &encode_error(error)))
            }
            Frame::StreamCancel { id } => {
                encode_raw(frame_type::STREAM_CANCEL, &id.to_le_bytes())
            }
        }
    }

    /// Encode this frame, refusing anything the peer's decoder would reject.
    pub fn encode_bounded(&self) -> Result<Vec<u8>> {
        let bytes = self.encode();
        let length = bytes.len() - 4;
        if length > MAX_FRAME_SIZE as usize {
            bail!(
                "Frame {} too large: {length} bytes (max {MAX_FRAME_SIZE})",
                self.id()
            );
        }
        Ok(bytes)
    }
}

fn id_payload(id: u32, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + body.len());
    payload.extend_from_slice(&id.to_le_bytes());
    payload.extend_from_slice(body);
    payload
}

fn call_payload(id: u32, method: u32, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + body.len());
    payload.extend_from_slice(&id.to_le_bytes());
    payload.extend_from_slice(&method.to_le_bytes());
    payload.extend_from_slice(body);
    payload
}

fn encode_error(error: &RemoteError) -> Vec<u8> {
    let message = error.message.as_bytes();
    let stack = error.stack.as_bytes();
    let mut buf = Vec::with_capacity(4 + message.len() + stack.len());
    buf.extend_from_slice(&(message.len() as u32).to_le_bytes());
    buf.extend_from_slice(message);
    buf.extend_from_slice(stack);
    buf
}

fn decode_error(payload: &[u8]) -> Result<RemoteError> {
    if payload.len() < 4 {
        bail!("Error payload too short: {} bytes", payload.len());
    }
    let message_len = read_u32(payload, 0) as usize;
    let Some(message) = payload.get(4..4 + message_len) else {
        bail!("Error message length {message_len} exceeds payload");
    };
    Ok(RemoteError {
        message: String::from_utf8_lossy(message).into_owned(),
        stack: String::from_utf8_lossy(&payload[4 + message_len..]).into_owned(),
    })
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Encode a raw frame with type byte and payload.
fn encode_raw(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32; // +1 for type byte
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    buf
}

/// Decode a single frame from a type byte and payload.
fn decode_frame(frame_type: u8, payload: &[u8]) -> Result<Frame> {
    let min_len = match frame_type {
        frame_type::REQUEST | frame_type::SUBSCRIBE => 8,
        frame_type::RESPONSE
        | frame_type::ERROR
        | frame_type::STREAM_DATA
        | frame_type::STREAM_END
        | frame_type::STREAM_ERROR
        | frame_type::STREAM_CANCEL => 4,
        _ => bail!("Unknown frame type: 0x{frame_type:02x}"),
    };
    if payload.len() < min_len {
        bail!(
            "Frame 0x{frame_type:02x} too short: {} bytes (need {min_len})",
            payload.len()
        );
    }

    let id = read_u32(payload, 0);
    let frame = match frame_type {
        frame_type::REQUEST => Frame::Request {
            id,
            method: read_u32(payload, 4),
            body: payload[8..].to_vec(),
        },
        frame_type::SUBSCRIBE => Frame::Subscribe {
            id,
            method: read_u32(payload, 4),
            body: payload[8..].to_vec(),
        },
        frame_type::RESPONSE => Frame::Response {
            id,
            body: payload[4..].to_vec(),
        },
        frame_type::STREAM_DATA => Frame::StreamData {
            id,
            body: payload[4..].to_vec(),
        },
        frame_type::ERROR => Frame::Error {
            id,
            error: decode_error(&payload[4..])?,
        },
        frame_type::STREAM_ERROR => Frame::StreamError {
            id,
            error: decode_error(&payload[4..])?,
        },
        frame_type::STREAM_END => Frame::StreamEnd { id },
        _ => Frame::StreamCancel { id },
    };
    Ok(frame)
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
/// The IPC pipe may split or coalesce writes arbitrarily.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Returns decoded frames. Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is malformed or exceeds the size limit.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut consumed = 0;

        loop {
            let rest = &self.buf[consumed..];
            // Need at least 4 bytes for the length header
            if rest.len() < 4 {
                break;
            }

            let length = read_u32(rest, 0);
            if length == 0 {
                bail!("Invalid frame: zero length");
            }
            if length > MAX_FRAME_SIZE {
                bail!("Frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
            }

            let total = 4 + length as usize;
            if rest.len() < total {
                break; // Incomplete frame, wait for more data
            }

            frames.push(decode_frame(rest[4], &rest[5..total])?);
            consumed += total;
        }

        self.buf.drain(..consumed);
        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
