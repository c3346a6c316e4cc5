use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// 1 byte frame type + 4 byte big-endian stream id.
pub const HEADER_LEN: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0} bytes is shorter than the {HEADER_LEN} byte header")]
    MalformedFrame(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Open,
    Data,
    Close,
    Error,
    Ack,
    /// A type byte this client does not understand. Kept so newer peers can add frame
    /// types without breaking older clients.
    Unknown(u8),
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Open => 1,
            FrameType::Data => 2,
            FrameType::Close => 3,
            FrameType::Error => 4,
            FrameType::Ack => 5,
            FrameType::Unknown(b) => b,
        }
    }
}

impl From<u8> for FrameType {
    fn from(b: u8) -> Self {
        match b {
            1 => FrameType::Open,
            2 => FrameType::Data,
            3 => FrameType::Close,
            4 => FrameType::Error,
            5 => FrameType::Ack,
            other => FrameType::Unknown(other),
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameType::Open => write!(f, "open"),
            FrameType::Data => write!(f, "data"),
            FrameType::Close => write!(f, "close"),
            FrameType::Error => write!(f, "error"),
            FrameType::Ack => write!(f, "ack"),
            FrameType::Unknown(b) => write!(f, "unknown({b})"),
        }
    }
}

/// One routing unit on the wire. Each frame travels as exactly one binary WebSocket
/// message, so there is no length prefix: the message boundary delimits the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            stream_id,
            payload: payload.into(),
        }
    }

    /// `Open` frame asking the remote end to dial `addr` (`"<ip>:<port>"`).
    pub fn open(stream_id: u32, addr: &str) -> Self {
        Self::new(FrameType::Open, stream_id, Bytes::copy_from_slice(addr.as_bytes()))
    }

    pub fn data(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Data, stream_id, payload)
    }

    pub fn close(stream_id: u32) -> Self {
        Self::new(FrameType::Close, stream_id, Bytes::new())
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.kind.as_u8());
        buf.put_u32(self.stream_id);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    pub fn decode(b: &[u8]) -> Result<Self, ProtocolError> {
        if b.len() < HEADER_LEN {
            return Err(ProtocolError::MalformedFrame(b.len()));
        }
        let kind = FrameType::from(b[0]);
        let stream_id = u32::from_be_bytes([b[1], b[2], b[3], b[4]]);
        Ok(Self {
            kind,
            stream_id,
            payload: Bytes::copy_from_slice(&b[HEADER_LEN..]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout_is_type_then_big_endian_id_then_payload() {
        let f = Frame::data(0x0102_0304, &b"hi"[..]);
        let b = f.encode();
        assert_eq!(b, vec![2, 1, 2, 3, 4, b'h', b'i']);
        assert_eq!(b.len(), f.encoded_len());
    }

    #[test]
    fn decode_inverts_encode() {
        let cases = [
            Frame::open(2, "127.0.0.1:5555"),
            Frame::data(4, vec![0u8; 70_000]),
            Frame::close(u32::MAX - 1),
            Frame::new(FrameType::Error, 6, &b"dial failed"[..]),
            Frame::new(FrameType::Ack, 8, Bytes::new()),
        ];
        for f in cases {
            assert_eq!(Frame::decode(&f.encode()).unwrap(), f);
        }
    }

    #[test]
    fn short_input_is_malformed() {
        for n in 0..HEADER_LEN {
            let b = vec![2u8; n];
            assert_eq!(Frame::decode(&b), Err(ProtocolError::MalformedFrame(n)));
        }
    }

    #[test]
    fn header_only_frame_has_empty_payload() {
        let f = Frame::decode(&[3, 0, 0, 0, 2]).unwrap();
        assert_eq!(f.kind, FrameType::Close);
        assert_eq!(f.stream_id, 2);
        assert!(f.payload.is_empty());
    }

    #[test]
    fn unknown_type_decodes_instead_of_failing() {
        let f = Frame::decode(&[42, 0, 0, 0, 9, 1]).unwrap();
        assert_eq!(f.kind, FrameType::Unknown(42));
        assert_eq!(f.kind.as_u8(), 42);
        assert_eq!(f.encode(), vec![42, 0, 0, 0, 9, 1]);
    }
}
