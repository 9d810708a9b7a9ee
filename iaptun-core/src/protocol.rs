//! Wire protocol for relay communication.
//!
//! Each WebSocket binary message carries exactly one frame: a 2-byte tag
//! followed by a tag-specific body. All integers are big-endian.
//! Connection termination is signalled by the WebSocket close frame and its
//! [`CloseCode`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// WebSocket subprotocol spoken by the relay.
pub const SUBPROTOCOL: &str = "relay.tunnel.cloudproxy.app";

/// Maximum payload carried by a single data frame.
pub const MAX_DATA_FRAME_SIZE: usize = 16 * 1024;

/// Maximum length of a session id.
pub const MAX_SESSION_ID_SIZE: usize = 1024;

/// Largest encoded frame: tag + length + maximum payload.
pub const MAX_FRAME_SIZE: usize = 2 + 4 + MAX_DATA_FRAME_SIZE;

/// Frame tag values.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    ConnectSuccessSid = 0x0001,
    ReconnectSuccessAck = 0x0002,
    Data = 0x0004,
    Ack = 0x0007,
}

impl TryFrom<u16> for Tag {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Tag::ConnectSuccessSid),
            0x0002 => Ok(Tag::ReconnectSuccessAck),
            0x0004 => Ok(Tag::Data),
            0x0007 => Ok(Tag::Ack),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Frame decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown frame tag 0x{0:04x}")]
    UnknownTag(u16),
    #[error("Truncated {frame} frame: need {needed} bytes, have {available}")]
    Truncated {
        frame: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("{frame} frame length {len} exceeds maximum {max}")]
    TooLarge {
        frame: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("Session id is not valid UTF-8")]
    InvalidSessionId,
}

/// A relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Initial handshake succeeded; carries the session id for reconnects.
    ConnectSuccessSid(String),
    /// Reconnect succeeded; carries the bytes the relay has received so far.
    ReconnectSuccessAck(u64),
    /// Application bytes.
    Data(Bytes),
    /// Cumulative count of bytes received by the sender of this frame.
    Ack(u64),
}

impl Frame {
    /// Get the tag of this frame.
    pub fn tag(&self) -> Tag {
        match self {
            Frame::ConnectSuccessSid(_) => Tag::ConnectSuccessSid,
            Frame::ReconnectSuccessAck(_) => Tag::ReconnectSuccessAck,
            Frame::Data(_) => Tag::Data,
            Frame::Ack(_) => Tag::Ack,
        }
    }

    /// Encode to wire bytes.
    ///
    /// Callers keep data payloads within [`MAX_DATA_FRAME_SIZE`].
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u16(self.tag() as u16);
        match self {
            Frame::ConnectSuccessSid(sid) => {
                buf.put_u32(sid.len() as u32);
                buf.put_slice(sid.as_bytes());
            }
            Frame::ReconnectSuccessAck(n) | Frame::Ack(n) => buf.put_u64(*n),
            Frame::Data(data) => {
                debug_assert!(data.len() <= MAX_DATA_FRAME_SIZE);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        2 + match self {
            Frame::ConnectSuccessSid(sid) => 4 + sid.len(),
            Frame::ReconnectSuccessAck(_) | Frame::Ack(_) => 8,
            Frame::Data(data) => 4 + data.len(),
        }
    }

    /// Decode a single frame occupying the whole message.
    pub fn decode(message: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = message;
        let tag = Tag::try_from(read_u16(&mut buf, "frame")?)?;

        let frame = match tag {
            Tag::ConnectSuccessSid => {
                let sid = read_chunk(&mut buf, "connect-success", MAX_SESSION_ID_SIZE)?;
                let sid = String::from_utf8(sid.to_vec())
                    .map_err(|_| ProtocolError::InvalidSessionId)?;
                Frame::ConnectSuccessSid(sid)
            }
            Tag::ReconnectSuccessAck => {
                Frame::ReconnectSuccessAck(read_u64(&mut buf, "reconnect-success")?)
            }
            Tag::Data => Frame::Data(Bytes::copy_from_slice(read_chunk(
                &mut buf,
                "data",
                MAX_DATA_FRAME_SIZE,
            )?)),
            Tag::Ack => Frame::Ack(read_u64(&mut buf, "ack")?),
        };

        if buf.has_remaining() {
            return Err(ProtocolError::TrailingBytes(buf.remaining()));
        }

        Ok(frame)
    }
}

fn ensure(buf: &[u8], frame: &'static str, needed: usize) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            frame,
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn read_u16(buf: &mut &[u8], frame: &'static str) -> Result<u16, ProtocolError> {
    ensure(buf, frame, 2)?;
    Ok(buf.get_u16())
}

fn read_u64(buf: &mut &[u8], frame: &'static str) -> Result<u64, ProtocolError> {
    ensure(buf, frame, 8)?;
    Ok(buf.get_u64())
}

fn read_chunk<'a>(
    buf: &mut &'a [u8],
    frame: &'static str,
    max: usize,
) -> Result<&'a [u8], ProtocolError> {
    ensure(buf, frame, 4)?;
    let len = buf.get_u32() as usize;
    if len > max {
        return Err(ProtocolError::TooLarge { frame, len, max });
    }
    ensure(buf, frame, len)?;
    let remaining: &'a [u8] = *buf;
    let (chunk, rest) = remaining.split_at(len);
    *buf = rest;
    Ok(chunk)
}

/// Split a write into data frames of at most [`MAX_DATA_FRAME_SIZE`] bytes.
pub fn data_frames(data: &Bytes) -> impl Iterator<Item = Frame> + '_ {
    (0..data.len())
        .step_by(MAX_DATA_FRAME_SIZE)
        .map(move |start| {
            let end = usize::min(start + MAX_DATA_FRAME_SIZE, data.len());
            Frame::Data(data.slice(start..end))
        })
}

/// WebSocket close codes used by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    ErrorUnknown,
    SidUnknown,
    SidInUse,
    FailedToConnectToBackend,
    ReauthenticationRequired,
    BadAck,
    InvalidAck,
    InvalidWebSocketOpcode,
    InvalidTag,
    DestinationWriteFailed,
    DestinationReadFailed,
    InvalidData,
    NotAuthorized,
    LookupFailed,
    LookupFailedReconnect,
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            4000 => CloseCode::ErrorUnknown,
            4001 => CloseCode::SidUnknown,
            4002 => CloseCode::SidInUse,
            4003 => CloseCode::FailedToConnectToBackend,
            4004 => CloseCode::ReauthenticationRequired,
            4005 => CloseCode::BadAck,
            4006 => CloseCode::InvalidAck,
            4007 => CloseCode::InvalidWebSocketOpcode,
            4008 => CloseCode::InvalidTag,
            4009 => CloseCode::DestinationWriteFailed,
            4010 => CloseCode::DestinationReadFailed,
            4013 => CloseCode::InvalidData,
            4033 => CloseCode::NotAuthorized,
            4047 => CloseCode::LookupFailed,
            4051 => CloseCode::LookupFailedReconnect,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::ErrorUnknown => 4000,
            CloseCode::SidUnknown => 4001,
            CloseCode::SidInUse => 4002,
            CloseCode::FailedToConnectToBackend => 4003,
            CloseCode::ReauthenticationRequired => 4004,
            CloseCode::BadAck => 4005,
            CloseCode::InvalidAck => 4006,
            CloseCode::InvalidWebSocketOpcode => 4007,
            CloseCode::InvalidTag => 4008,
            CloseCode::DestinationWriteFailed => 4009,
            CloseCode::DestinationReadFailed => 4010,
            CloseCode::InvalidData => 4013,
            CloseCode::NotAuthorized => 4033,
            CloseCode::LookupFailed => 4047,
            CloseCode::LookupFailedReconnect => 4051,
            CloseCode::Other(other) => other,
        }
    }
}

/// What a close code means for the stream that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Graceful end of stream.
    EndOfStream,
    /// Credential rejected or target unknown.
    Unauthorized,
    /// Session cannot be resumed, or the backend is unreachable.
    Terminal,
    /// The relay considers our frames malformed.
    ProtocolViolation,
    /// Worth a reconnect with the existing session id.
    Transient,
}

impl CloseCode {
    /// Classify this close code.
    pub fn disposition(self) -> CloseDisposition {
        match self {
            CloseCode::Normal => CloseDisposition::EndOfStream,
            CloseCode::ReauthenticationRequired
            | CloseCode::NotAuthorized
            | CloseCode::LookupFailed => CloseDisposition::Unauthorized,
            CloseCode::SidUnknown
            | CloseCode::SidInUse
            | CloseCode::LookupFailedReconnect
            | CloseCode::FailedToConnectToBackend
            | CloseCode::DestinationWriteFailed
            | CloseCode::DestinationReadFailed => CloseDisposition::Terminal,
            CloseCode::BadAck
            | CloseCode::InvalidAck
            | CloseCode::InvalidWebSocketOpcode
            | CloseCode::InvalidTag
            | CloseCode::InvalidData => CloseDisposition::ProtocolViolation,
            CloseCode::ErrorUnknown | CloseCode::Other(_) => CloseDisposition::Transient,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseCode::Other(code) => write!(f, "close code {}", code),
            known => write!(f, "{:?} ({})", known, u16::from(*known)),
        }
    }
}
