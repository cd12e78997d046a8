//! Minimal CQL-style frame layer.
//!
//! The pool only needs enough of the wire protocol to drive the handshake
//! (STARTUP, AUTHENTICATE, AUTH_RESPONSE, keyspace selection) and to
//! multiplex requests over stream ids. Header layout:
//!
//! ```text
//! [version u8][opcode u8][stream i16 BE][length u32 BE][body ...]
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// Frame header length in bytes.
pub const HEADER_LEN: usize = 8;

/// Maximum allowed frame body length.
pub const MAX_BODY_LEN: usize = 1024 * 1024;

/// Number of usable stream ids per connection. Stream ids are non-negative
/// `i16` values, so at most this many requests can be in flight at once.
pub const MAX_STREAMS: usize = 1 << 15;

/// Protocol version carried in every frame header.
///
/// The requested version is negotiated during STARTUP; a server that does
/// not support it rejects the connection with a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(u8);

impl ProtocolVersion {
    /// Protocol version 3.
    pub const V3: Self = Self(3);
    /// Protocol version 4.
    pub const V4: Self = Self(4);
    /// Protocol version 5.
    pub const V5: Self = Self(5);

    /// Create a version from its raw wire value.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// The raw wire value.
    #[must_use]
    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::V4
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Frame opcodes.
pub mod opcode {
    /// Error response.
    pub const ERROR: u8 = 0x00;
    /// Connection startup / version negotiation request.
    pub const STARTUP: u8 = 0x01;
    /// Startup accepted, no authentication required.
    pub const READY: u8 = 0x02;
    /// Server demands authentication.
    pub const AUTHENTICATE: u8 = 0x03;
    /// Query request.
    pub const QUERY: u8 = 0x07;
    /// Query result.
    pub const RESULT: u8 = 0x08;
    /// Client authentication token.
    pub const AUTH_RESPONSE: u8 = 0x0F;
    /// Authentication accepted.
    pub const AUTH_SUCCESS: u8 = 0x10;
}

/// Server error codes carried in ERROR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Generic server-side error.
    Server,
    /// Requested protocol version is not supported.
    Protocol,
    /// Authentication rejected.
    BadCredentials,
    /// Invalid request (unknown keyspace, malformed query).
    Invalid,
}

impl ErrorCode {
    /// The raw wire value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Server => 0x0000,
            Self::Protocol => 0x000A,
            Self::BadCredentials => 0x0100,
            Self::Invalid => 0x2200,
        }
    }

    /// Decode a wire value; unknown codes map to [`ErrorCode::Server`].
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        match value {
            0x000A => Self::Protocol,
            0x0100 => Self::BadCredentials,
            0x2200 => Self::Invalid,
            _ => Self::Server,
        }
    }
}

/// Result kinds carried in RESULT frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultKind {
    /// Statement executed, no payload.
    Void,
    /// Keyspace switched; carries the new keyspace name.
    SetKeyspace(String),
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Error response.
    Error {
        /// Error classification.
        code: ErrorCode,
        /// Human-readable message from the server.
        message: String,
    },
    /// Startup request; the requested version rides in the frame header.
    Startup,
    /// Startup accepted.
    Ready,
    /// Server demands authentication; carries the authenticator name.
    Authenticate(String),
    /// Query request.
    Query(String),
    /// Query result.
    Result(ResultKind),
    /// Client authentication token.
    AuthResponse(Bytes),
    /// Authentication accepted.
    AuthSuccess,
}

impl Message {
    /// The opcode this message is encoded with.
    #[must_use]
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Error { .. } => opcode::ERROR,
            Self::Startup => opcode::STARTUP,
            Self::Ready => opcode::READY,
            Self::Authenticate(_) => opcode::AUTHENTICATE,
            Self::Query(_) => opcode::QUERY,
            Self::Result(_) => opcode::RESULT,
            Self::AuthResponse(_) => opcode::AUTH_RESPONSE,
            Self::AuthSuccess => opcode::AUTH_SUCCESS,
        }
    }

    fn encode_body(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            Self::Error { code, message } => {
                dst.put_u32(code.as_u32());
                write_string(dst, message)?;
            }
            Self::Startup | Self::Ready | Self::AuthSuccess => {}
            Self::Authenticate(authenticator) => write_string(dst, authenticator)?,
            Self::Query(query) => write_long_string(dst, query),
            Self::Result(ResultKind::Void) => dst.put_u32(1),
            Self::Result(ResultKind::SetKeyspace(keyspace)) => {
                dst.put_u32(3);
                write_string(dst, keyspace)?;
            }
            Self::AuthResponse(token) => {
                dst.put_u32(token.len() as u32);
                dst.extend_from_slice(token);
            }
        }
        Ok(())
    }

    fn decode(opcode: u8, mut body: Bytes) -> Result<Self, CodecError> {
        match opcode {
            opcode::ERROR => {
                let code = ErrorCode::from_u32(read_u32(&mut body)?);
                let message = read_string(&mut body)?;
                Ok(Self::Error { code, message })
            }
            opcode::STARTUP => Ok(Self::Startup),
            opcode::READY => Ok(Self::Ready),
            opcode::AUTHENTICATE => Ok(Self::Authenticate(read_string(&mut body)?)),
            opcode::QUERY => Ok(Self::Query(read_long_string(&mut body)?)),
            opcode::RESULT => match read_u32(&mut body)? {
                1 => Ok(Self::Result(ResultKind::Void)),
                3 => Ok(Self::Result(ResultKind::SetKeyspace(read_string(
                    &mut body,
                )?))),
                kind => Err(CodecError::InvalidResultKind(kind)),
            },
            opcode::AUTH_RESPONSE => {
                let len = read_u32(&mut body)? as usize;
                if body.remaining() < len {
                    return Err(CodecError::Truncated);
                }
                Ok(Self::AuthResponse(body.split_to(len)))
            }
            opcode::AUTH_SUCCESS => Ok(Self::AuthSuccess),
            other => Err(CodecError::InvalidOpcode(other)),
        }
    }
}

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version from the header.
    pub version: ProtocolVersion,
    /// Stream id correlating requests with responses.
    pub stream: i16,
    /// The decoded message.
    pub message: Message,
}

/// Codec translating between byte streams and [`Frame`]s.
#[derive(Debug, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if body_len > MAX_BODY_LEN {
            return Err(CodecError::FrameTooLarge {
                size: body_len,
                max: MAX_BODY_LEN,
            });
        }
        if src.len() < HEADER_LEN + body_len {
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        let header = src.split_to(HEADER_LEN);
        let version = ProtocolVersion::new(header[0]);
        let opcode = header[1];
        let stream = i16::from_be_bytes([header[2], header[3]]);
        let body = src.split_to(body_len).freeze();

        let message = Message::decode(opcode, body)?;
        Ok(Some(Frame {
            version,
            stream,
            message,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut body = BytesMut::new();
        frame.message.encode_body(&mut body)?;
        if body.len() > MAX_BODY_LEN {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                max: MAX_BODY_LEN,
            });
        }

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u8(frame.version.value());
        dst.put_u8(frame.message.opcode());
        dst.put_i16(frame.stream);
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

fn write_string(dst: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    let len = u16::try_from(value.len()).map_err(|_| CodecError::StringTooLong(value.len()))?;
    dst.put_u16(len);
    dst.extend_from_slice(value.as_bytes());
    Ok(())
}

fn write_long_string(dst: &mut BytesMut, value: &str) {
    dst.put_u32(value.len() as u32);
    dst.extend_from_slice(value.as_bytes());
}

fn read_u32(body: &mut Bytes) -> Result<u32, CodecError> {
    if body.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(body.get_u32())
}

fn read_string(body: &mut Bytes) -> Result<String, CodecError> {
    if body.remaining() < 2 {
        return Err(CodecError::Truncated);
    }
    let len = body.get_u16() as usize;
    read_utf8(body, len)
}

fn read_long_string(body: &mut Bytes) -> Result<String, CodecError> {
    let len = read_u32(body)? as usize;
    read_utf8(body, len)
}

fn read_utf8(body: &mut Bytes, len: usize) -> Result<String, CodecError> {
    if body.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_query_frame_roundtrip() {
        let frame = Frame {
            version: ProtocolVersion::V4,
            stream: 42,
            message: Message::Query("SELECT * FROM blah".to_string()),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_error_frame_roundtrip() {
        let frame = Frame {
            version: ProtocolVersion::V4,
            stream: -1,
            message: Message::Error {
                code: ErrorCode::BadCredentials,
                message: "Bad credentials".to_string(),
            },
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_partial_header_needs_more_data() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[4u8, 2, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_invalid_opcode_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        buf.put_u8(0x7E);
        buf.put_i16(0);
        buf.put_u32(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::InvalidOpcode(0x7E))
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        buf.put_u8(opcode::QUERY);
        buf.put_i16(0);
        buf.put_u32((MAX_BODY_LEN + 1) as u32);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_oversized_string_field_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = Frame {
            version: ProtocolVersion::V4,
            stream: 0,
            message: Message::Authenticate("x".repeat(u16::MAX as usize + 1)),
        };
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(CodecError::StringTooLong(65536))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_error_code_wire_values() {
        assert_eq!(ErrorCode::from_u32(0x000A), ErrorCode::Protocol);
        assert_eq!(ErrorCode::from_u32(0x0100), ErrorCode::BadCredentials);
        assert_eq!(ErrorCode::from_u32(0x2200), ErrorCode::Invalid);
        assert_eq!(ErrorCode::from_u32(0xBEEF), ErrorCode::Server);
    }
}
