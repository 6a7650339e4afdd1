//! Binary framing for the client protocol.
//!
//! Every frame is `[length: u32][correlation id: u64][opcode: u8][flags: u8][payload]`
//! in network byte order, where `length` counts everything after the prefix.
//! Responses carry the `RESPONSE` flag and start their payload with a status
//! byte. A connection may carry many requests at once; responses are matched
//! back purely by correlation id.

use std::{fmt, ops::BitOr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GridClientError, Result};

/// Bytes following the length prefix that every frame carries.
pub const HEADER_LEN: usize = 8 + 1 + 1;
const LENGTH_PREFIX_LEN: usize = 4;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Handshake = 0x01,
    Noop = 0x02,
    Topology = 0x03,
    CacheGet = 0x10,
    CachePut = 0x11,
    CacheRemove = 0x12,
    CacheReplace = 0x13,
    CacheCompareAndSet = 0x14,
    CacheGetAll = 0x15,
    CachePutAll = 0x16,
    CacheRemoveAll = 0x17,
    Task = 0x20,
}

impl Opcode {
    /// Whether replaying the operation after an unacknowledged send is harmless.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Opcode::CacheReplace | Opcode::CacheCompareAndSet | Opcode::Task)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = GridClientError;

    fn try_from(value: u8) -> Result<Self> {
        let opcode = match value {
            0x01 => Opcode::Handshake,
            0x02 => Opcode::Noop,
            0x03 => Opcode::Topology,
            0x10 => Opcode::CacheGet,
            0x11 => Opcode::CachePut,
            0x12 => Opcode::CacheRemove,
            0x13 => Opcode::CacheReplace,
            0x14 => Opcode::CacheCompareAndSet,
            0x15 => Opcode::CacheGetAll,
            0x16 => Opcode::CachePutAll,
            0x17 => Opcode::CacheRemoveAll,
            0x20 => Opcode::Task,
            other => {
                return Err(GridClientError::Protocol(format!(
                    "unexpected opcode {other:#04x}"
                )))
            }
        };
        Ok(opcode)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const EMPTY: Flags = Flags(0);
    pub const RESPONSE: Flags = Flags(0b0000_0001);
    pub const INCLUDE_METRICS: Flags = Flags(0b0000_0010);
    pub const INCLUDE_ATTRIBUTES: Flags = Flags(0b0000_0100);

    const KNOWN: u8 = 0b0000_0111;

    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !Self::KNOWN != 0 {
            return Err(GridClientError::Protocol(format!(
                "unknown flag bits {:#010b}",
                bits & !Self::KNOWN
            )));
        }
        Ok(Flags(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn without(self, other: Flags) -> Flags {
        Flags(self.0 & !other.0)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// One unit on the wire, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub correlation_id: u64,
    pub opcode: Opcode,
    pub flags: Flags,
    pub payload: Bytes,
}

impl Frame {
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let length = HEADER_LEN + self.payload.len();
        if length > MAX_FRAME_LEN {
            return Err(GridClientError::Protocol(format!(
                "frame of {length} bytes exceeds limit of {MAX_FRAME_LEN}"
            )));
        }
        dst.reserve(LENGTH_PREFIX_LEN + length);
        dst.put_u32(length as u32);
        dst.put_u64(self.correlation_id);
        dst.put_u8(self.opcode as u8);
        dst.put_u8(self.flags.bits());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Decodes one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched while the frame is incomplete.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length < HEADER_LEN {
            return Err(GridClientError::Protocol(format!(
                "frame length {length} shorter than header"
            )));
        }
        if length > MAX_FRAME_LEN {
            return Err(GridClientError::Protocol(format!(
                "frame length {length} exceeds limit of {MAX_FRAME_LEN}"
            )));
        }
        if src.len() < LENGTH_PREFIX_LEN + length {
            src.reserve(LENGTH_PREFIX_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let mut body = src.split_to(length);
        let correlation_id = body.get_u64();
        let opcode = Opcode::try_from(body.get_u8())?;
        let flags = Flags::from_bits(body.get_u8())?;

        Ok(Some(Frame {
            correlation_id,
            opcode,
            flags,
            payload: body.freeze(),
        }))
    }
}

/// Status byte leading every response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0,
    Failed = 1,
    AuthFailed = 2,
}

impl TryFrom<u8> for ResponseStatus {
    type Error = GridClientError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ResponseStatus::Success),
            1 => Ok(ResponseStatus::Failed),
            2 => Ok(ResponseStatus::AuthFailed),
            other => Err(GridClientError::Protocol(format!(
                "unknown response status {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub correlation_id: u64,
    pub opcode: Opcode,
    pub flags: Flags,
    pub payload: Bytes,
}

impl Request {
    pub fn into_frame(self) -> Frame {
        Frame {
            correlation_id: self.correlation_id,
            opcode: self.opcode,
            flags: self.flags,
            payload: self.payload,
        }
    }

    pub fn from_frame(frame: Frame) -> Result<Self> {
        if frame.flags.contains(Flags::RESPONSE) {
            return Err(GridClientError::Protocol(format!(
                "expected request frame, got response {}",
                frame.correlation_id
            )));
        }
        Ok(Request {
            correlation_id: frame.correlation_id,
            opcode: frame.opcode,
            flags: frame.flags,
            payload: frame.payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub correlation_id: u64,
    pub opcode: Opcode,
    pub status: ResponseStatus,
    pub body: Bytes,
}

impl Response {
    pub fn success(request: &Request, body: impl Into<Bytes>) -> Self {
        Self::with_status(request, ResponseStatus::Success, body)
    }

    pub fn failure(
        request: &Request,
        status: ResponseStatus,
        diagnostic: impl fmt::Display,
    ) -> Self {
        Self::with_status(request, status, diagnostic.to_string())
    }

    fn with_status(request: &Request, status: ResponseStatus, body: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: request.correlation_id,
            opcode: request.opcode,
            status,
            body: body.into(),
        }
    }

    pub fn into_frame(self) -> Frame {
        let mut payload = BytesMut::with_capacity(1 + self.body.len());
        payload.put_u8(self.status as u8);
        payload.put_slice(&self.body);
        Frame {
            correlation_id: self.correlation_id,
            opcode: self.opcode,
            flags: Flags::RESPONSE,
            payload: payload.freeze(),
        }
    }

    pub fn from_frame(frame: Frame) -> Result<Self> {
        if !frame.flags.contains(Flags::RESPONSE) {
            return Err(GridClientError::Protocol(format!(
                "expected response frame, got request {}",
                frame.correlation_id
            )));
        }
        let mut payload = frame.payload;
        if payload.is_empty() {
            return Err(GridClientError::Protocol(format!(
                "response {} is missing its status byte",
                frame.correlation_id
            )));
        }
        let status = ResponseStatus::try_from(payload.get_u8())?;
        Ok(Response {
            correlation_id: frame.correlation_id,
            opcode: frame.opcode,
            status,
            body: payload,
        })
    }

    /// Maps the server status onto the client error taxonomy.
    pub fn into_body(self) -> Result<Bytes> {
        match self.status {
            ResponseStatus::Success => Ok(self.body),
            ResponseStatus::Failed => Err(GridClientError::RemoteExecution {
                diagnostic: String::from_utf8_lossy(&self.body).into_owned(),
            }),
            ResponseStatus::AuthFailed => Err(GridClientError::Authentication(
                String::from_utf8_lossy(&self.body).into_owned(),
            )),
        }
    }
}

/// Reads the next frame, buffering partial input in `buf` between calls.
///
/// Cancel safe: bytes already read stay in `buf`. Returns `Ok(None)` on a
/// clean end of stream.
pub async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = Frame::decode(buf)? {
            return Ok(Some(frame));
        }

        let read = reader
            .read_buf(buf)
            .await
            .map_err(|err| GridClientError::unreachable(format!("read failed: {err}")))?;
        if read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(GridClientError::Protocol(format!(
                "stream ended inside a frame with {} bytes buffered",
                buf.len()
            )));
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Encode once and flush so the peer sees whole frames promptly.
    let mut encoded = BytesMut::new();
    frame.encode(&mut encoded)?;
    writer
        .write_all(&encoded)
        .await
        .map_err(|err| GridClientError::unreachable(format!("write failed: {err}")))?;
    writer
        .flush()
        .await
        .map_err(|err| GridClientError::unreachable(format!("flush failed: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64) -> Request {
        Request {
            correlation_id: id,
            opcode: Opcode::CacheGet,
            flags: Flags::EMPTY,
            payload: Bytes::from_static(b"{}"),
        }
    }

    #[test]
    fn encodes_header_in_network_order() {
        let frame = Frame {
            correlation_id: 0x0102_0304_0506_0708,
            opcode: Opcode::Task,
            flags: Flags::INCLUDE_METRICS | Flags::INCLUDE_ATTRIBUTES,
            payload: Bytes::from_static(b"xy"),
        };
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).expect("encode");

        assert_eq!(
            &buf[..],
            &[0, 0, 0, 12, 1, 2, 3, 4, 5, 6, 7, 8, 0x20, 0b110, b'x', b'y']
        );
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut full = BytesMut::new();
        request(9).into_frame().encode(&mut full).expect("encode");

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(Frame::decode(&mut partial).expect("decode"), None);
        assert_eq!(partial.len(), full.len() - 1);

        partial.extend_from_slice(&full[full.len() - 1..]);
        let frame = Frame::decode(&mut partial).expect("decode").expect("frame");
        assert_eq!(frame.correlation_id, 9);
        assert!(partial.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut buf = BytesMut::new();
        request(1).into_frame().encode(&mut buf).expect("encode");
        request(2).into_frame().encode(&mut buf).expect("encode");

        let first = Frame::decode(&mut buf).expect("decode").expect("first");
        let second = Frame::decode(&mut buf).expect("decode").expect("second");
        assert_eq!((first.correlation_id, second.correlation_id), (1, 2));
        assert_eq!(Frame::decode(&mut buf).expect("decode"), None);
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut buf = BytesMut::new();
        buf.put_u32(HEADER_LEN as u32);
        buf.put_u64(1);
        buf.put_u8(0x7f);
        buf.put_u8(0);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(GridClientError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_unknown_flags_and_bad_lengths() {
        let mut buf = BytesMut::new();
        buf.put_u32(HEADER_LEN as u32);
        buf.put_u64(1);
        buf.put_u8(Opcode::Noop as u8);
        buf.put_u8(0b1000_0000);
        assert!(matches!(Frame::decode(&mut buf), Err(GridClientError::Protocol(_))));

        let mut short = BytesMut::new();
        short.put_u32(3);
        short.put_slice(&[0, 0, 0]);
        assert!(matches!(Frame::decode(&mut short), Err(GridClientError::Protocol(_))));

        let mut huge = BytesMut::new();
        huge.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(matches!(Frame::decode(&mut huge), Err(GridClientError::Protocol(_))));
    }

    #[test]
    fn response_requires_response_flag_and_status() {
        assert!(matches!(
            Response::from_frame(request(3).into_frame()),
            Err(GridClientError::Protocol(_))
        ));

        let empty = Frame {
            correlation_id: 3,
            opcode: Opcode::Noop,
            flags: Flags::RESPONSE,
            payload: Bytes::new(),
        };
        assert!(matches!(Response::from_frame(empty), Err(GridClientError::Protocol(_))));

        let bad_status = Frame {
            correlation_id: 3,
            opcode: Opcode::Noop,
            flags: Flags::RESPONSE,
            payload: Bytes::from_static(&[9]),
        };
        assert!(matches!(
            Response::from_frame(bad_status),
            Err(GridClientError::Protocol(_))
        ));
    }

    #[test]
    fn failure_status_maps_to_typed_errors() {
        let req = request(5);
        let failed = Response::failure(&req, ResponseStatus::Failed, "task blew up");
        let decoded = Response::from_frame(failed.into_frame()).expect("decode");
        match decoded.into_body() {
            Err(GridClientError::RemoteExecution { diagnostic }) => {
                assert_eq!(diagnostic, "task blew up")
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let denied = Response::failure(&req, ResponseStatus::AuthFailed, "bad token");
        assert!(matches!(
            denied.into_body(),
            Err(GridClientError::Authentication(_))
        ));
    }

    #[test]
    fn only_mutating_compound_operations_are_not_idempotent() {
        assert!(Opcode::CacheGet.is_idempotent());
        assert!(Opcode::CachePutAll.is_idempotent());
        assert!(!Opcode::CacheReplace.is_idempotent());
        assert!(!Opcode::CacheCompareAndSet.is_idempotent());
        assert!(!Opcode::Task.is_idempotent());
    }

    #[tokio::test]
    async fn stream_helpers_carry_frames() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        let sent = Response::success(&request(11), Bytes::from_static(b"true")).into_frame();

        write_frame(&mut writer, &sent).await.expect("write frame");
        drop(writer);

        let mut buf = BytesMut::new();
        let received = read_frame(&mut reader, &mut buf)
            .await
            .expect("read frame")
            .expect("expected frame");
        assert_eq!(received, sent);
        assert!(read_frame(&mut reader, &mut buf).await.expect("eof").is_none());
    }
}
