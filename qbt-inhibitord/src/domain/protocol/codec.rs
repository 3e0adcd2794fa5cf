use super::message::{ClientMessage, ServerMessage};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Terminator appended to every frame in both directions.
pub const FRAME_DELIMITER: &[u8] = b"\n\r";
pub const MAX_FRAME_LEN: usize = 64 * 1024;
/// Raw reply sent to anything that is not a protocol client.
pub const FORBIDDEN_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";

const HTTP_METHODS: &[&str] = &[
    "GET ", "POST ", "PUT ", "HEAD ", "DELETE ", "OPTIONS ", "PATCH ", "CONNECT ", "TRACE ",
];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error("frame is not valid utf-8")]
    InvalidUtf8,
    #[error("http request on protocol port")]
    HttpProbe,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected handshake, got `{0}`")]
    ExpectedHandshake(&'static str),
    #[error("timed out waiting for peer")]
    Timeout,
}

impl ProtocolError {
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::Io(_) => "io",
            ProtocolError::FrameTooLarge { .. } => "frame_too_large",
            ProtocolError::InvalidUtf8 => "invalid_utf8",
            ProtocolError::HttpProbe => "http_probe",
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::ExpectedHandshake(_) => "expected_handshake",
            ProtocolError::Timeout => "timeout",
        }
    }
}

/// Splits an inbound byte stream on [`FRAME_DELIMITER`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    next_index: usize,
    max_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LEN)
    }

    pub fn with_max_length(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        // Resume one byte early: the delimiter may straddle two reads.
        let start = self.next_index.saturating_sub(FRAME_DELIMITER.len() - 1);
        let found = src[start..]
            .windows(FRAME_DELIMITER.len())
            .position(|window| window == FRAME_DELIMITER)
            .map(|offset| start + offset);

        match found {
            Some(end) if end > self.max_len => Err(ProtocolError::FrameTooLarge {
                limit: self.max_len,
            }),
            Some(end) => {
                self.next_index = 0;
                let mut frame = src.split_to(end + FRAME_DELIMITER.len());
                frame.truncate(end);
                Ok(Some(frame.freeze()))
            }
            None if src.len() > self.max_len + FRAME_DELIMITER.len() => {
                Err(ProtocolError::FrameTooLarge {
                    limit: self.max_len,
                })
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }
}

pub fn encode_message(message: &ServerMessage) -> Result<Bytes, ProtocolError> {
    let mut buf = serde_json::to_vec(message)?;
    buf.extend_from_slice(FRAME_DELIMITER);
    Ok(Bytes::from(buf))
}

/// Recognises the request line of a stray HTTP client.
pub fn looks_like_http(text: &str) -> bool {
    let head = text.trim_start();
    let first_line = head.lines().next().unwrap_or_default();
    HTTP_METHODS.iter().any(|method| head.starts_with(method))
        || first_line.contains(" HTTP/1.")
        || first_line.starts_with("HTTP/")
}

pub fn decode_client(frame: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;
    if looks_like_http(text) {
        return Err(ProtocolError::HttpProbe);
    }
    Ok(serde_json::from_str(text.trim())?)
}
