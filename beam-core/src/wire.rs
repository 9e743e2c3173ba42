//! Encoding: JSON for signaling envelopes and control frames; text/binary frame kinds on the
//! channel; length-prefix (4 bytes LE) + kind byte for byte-stream transports.

use crate::protocol::{ControlFrame, SignalEnvelope, SignalKind};

const LEN_SIZE: usize = 4;
const HEADER_SIZE: usize = LEN_SIZE + 1;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

const KIND_TEXT: u8 = 0x01;
const KIND_BINARY: u8 = 0x02;

/// One application frame on the direct channel. The kind is carried by the channel's native
/// framing (text vs. binary message), never in-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Structured control frame (JSON).
    Text(String),
    /// Raw chunk bytes.
    Binary(Vec<u8>),
}

impl Frame {
    /// Bytes this frame occupies in the channel's send buffer.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serialize an envelope for the relay.
pub fn encode_envelope(env: &SignalEnvelope) -> Result<String, EnvelopeEncodeError> {
    Ok(serde_json::to_string(env)?)
}

#[derive(Debug, thiserror::Error)]
#[error("encode error: {0}")]
pub struct EnvelopeEncodeError(#[from] serde_json::Error);

/// Parse and validate an envelope received from the relay.
pub fn decode_envelope(text: &str) -> Result<SignalEnvelope, EnvelopeDecodeError> {
    let env: SignalEnvelope = serde_json::from_str(text)?;
    match env.kind {
        SignalKind::Offer | SignalKind::Answer if env.sdp.is_none() => {
            Err(EnvelopeDecodeError::MissingSdp(env.kind))
        }
        SignalKind::Candidate if env.candidate.is_none() => {
            Err(EnvelopeDecodeError::MissingCandidate)
        }
        _ => Ok(env),
    }
}

/// Error decoding a signaling envelope (bad JSON or missing payload for its kind).
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeDecodeError {
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("{0} envelope without sdp")]
    MissingSdp(SignalKind),
    #[error("candidate envelope without candidate")]
    MissingCandidate,
}

/// Encode a control frame as a text frame.
pub fn encode_control(frame: &ControlFrame) -> Result<Frame, FrameEncodeError> {
    Ok(Frame::Text(serde_json::to_string(frame)?))
}

/// Parse the body of a text frame.
pub fn decode_control(text: &str) -> Result<ControlFrame, ControlDecodeError> {
    Ok(serde_json::from_str(text)?)
}

#[derive(Debug, thiserror::Error)]
#[error("control frame decode error: {0}")]
pub struct ControlDecodeError(#[from] serde_json::Error);

/// Encode a frame for a byte-stream transport: 4 bytes LE body length + kind byte + body.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let (kind, body) = match frame {
        Frame::Text(s) => (KIND_TEXT, s.as_bytes()),
        Frame::Binary(b) => (KIND_BINARY, b.as_slice()),
    };
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = body.len() as u32;
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.push(kind);
    out.extend_from_slice(body);
    Ok(out)
}

/// Error encoding a frame (JSON or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns NeedMore if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let len = len as usize;
    if bytes.len() < HEADER_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let body = &bytes[HEADER_SIZE..HEADER_SIZE + len];
    let frame = match bytes[LEN_SIZE] {
        KIND_TEXT => Frame::Text(
            String::from_utf8(body.to_vec()).map_err(|_| FrameDecodeError::InvalidText)?,
        ),
        KIND_BINARY => Frame::Binary(body.to_vec()),
        other => return Err(FrameDecodeError::UnknownKind(other)),
    };
    Ok((frame, HEADER_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, unknown kind, or bad UTF-8).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("text frame is not valid utf-8")]
    InvalidText,
}
