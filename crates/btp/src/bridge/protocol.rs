//! BTP frame layout.
//!
//! ```text
//! ┌────────────┬────────┬──────────────────┬─────────────┬───────────────┐
//! │ Service ID │ Opcode │ Controller index │ Payload len │ Payload       │
//! │ 1 byte     │ 1 byte │ 1 byte           │ u16 LE      │ len bytes     │
//! └────────────┴────────┴──────────────────┴─────────────┴───────────────┘
//! ```
//!
//! There is no request id. A reply is matched to its command by position:
//! the next non-event frame after a command is its response.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::error::{BtpError, Result};

/// Header size in bytes.
pub const HEADER_LEN: usize = 5;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Opcodes at or above this value are unsolicited events.
pub const EVENT_OPCODE_MIN: u8 = 0x80;

/// Opcode used by the IUT to report that the preceding command failed.
pub const OP_STATUS: u8 = 0x00;

/// Controller index for commands that do not address a controller.
pub const INDEX_NONE: u8 = 0xff;

/// Status code carried in the first payload byte of a STATUS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Success,
    Failed,
    UnknownCommand,
    NotReady,
    Other(u8),
    /// STATUS frame arrived with an empty payload.
    Missing,
}

impl StatusCode {
    pub fn from_payload(payload: &[u8]) -> Self {
        match payload.first() {
            Some(0x00) => Self::Success,
            Some(0x01) => Self::Failed,
            Some(0x02) => Self::UnknownCommand,
            Some(0x03) => Self::NotReady,
            Some(&code) => Self::Other(code),
            None => Self::Missing,
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::UnknownCommand => write!(f, "unknown command"),
            Self::NotReady => write!(f, "not ready"),
            Self::Other(code) => write!(f, "status 0x{code:02x}"),
            Self::Missing => write!(f, "no status code"),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameHeader {
    pub service_id: u8,
    pub opcode: u8,
    pub controller_index: u8,
    pub payload_len: u16,
}

impl FrameHeader {
    pub fn new(service_id: u8, opcode: u8, controller_index: u8, payload_len: u16) -> Self {
        Self {
            service_id,
            opcode,
            controller_index,
            payload_len,
        }
    }

    /// Unsolicited, device-originated frame.
    #[inline]
    pub fn is_event(&self) -> bool {
        self.opcode >= EVENT_OPCODE_MIN
    }

    /// STATUS reply: the preceding command was rejected.
    #[inline]
    pub fn is_status(&self) -> bool {
        self.opcode == OP_STATUS
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.payload_len.to_le_bytes();
        [
            self.service_id,
            self.opcode,
            self.controller_index,
            len[0],
            len[1],
        ]
    }
}

/// One BTP message: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, filling in `payload_len` from the payload.
    pub fn new(
        service_id: u8,
        opcode: u8,
        controller_index: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self> {
        let payload = payload.into();
        let payload_len = u16::try_from(payload.len()).map_err(|_| BtpError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        })?;
        Ok(Self {
            header: FrameHeader::new(service_id, opcode, controller_index, payload_len),
            payload,
        })
    }

    pub fn is_event(&self) -> bool {
        self.header.is_event()
    }

    pub(crate) fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_slice(&self.header.encode());
        dst.put_slice(&self.payload);
    }
}

/// Encode a complete frame.
pub fn encode(service_id: u8, opcode: u8, controller_index: u8, payload: &[u8]) -> Result<Bytes> {
    let frame = Frame::new(
        service_id,
        opcode,
        controller_index,
        Bytes::copy_from_slice(payload),
    )?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.encode_into(&mut buf);
    Ok(buf.freeze())
}

/// Decode a fixed-size header.
pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> FrameHeader {
    FrameHeader {
        service_id: bytes[0],
        opcode: bytes[1],
        controller_index: bytes[2],
        payload_len: u16::from_le_bytes([bytes[3], bytes[4]]),
    }
}

/// Payloads are opaque at this layer.
pub fn decode_payload(bytes: &[u8]) -> Bytes {
    Bytes::copy_from_slice(bytes)
}

/// Decode a complete frame held in one buffer.
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    let (head, rest) = bytes
        .split_first_chunk::<HEADER_LEN>()
        .ok_or_else(|| BtpError::Decode(format!("frame shorter than header: {} bytes", bytes.len())))?;
    let header = decode_header(head);
    if rest.len() != header.payload_len as usize {
        return Err(BtpError::Decode(format!(
            "payload length {} does not match header length {}",
            rest.len(),
            header.payload_len
        )));
    }
    Ok(Frame {
        header,
        payload: decode_payload(rest),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_little_endian() {
        let bytes = encode(6, 0x01, 0, &[0xaa; 0x0102]).unwrap();
        assert_eq!(&bytes[..HEADER_LEN], &[6, 0x01, 0, 0x02, 0x01]);
        assert_eq!(bytes.len(), HEADER_LEN + 0x0102);
    }

    #[test]
    fn empty_payload_is_header_only() {
        let bytes = encode(1, 0x03, INDEX_NONE, &[]).unwrap();
        assert_eq!(&bytes[..], &[1, 0x03, 0xff, 0x00, 0x00]);
    }

    #[test]
    fn decode_roundtrips_header_and_payload() {
        let payloads: [&[u8]; 4] = [b"", b"\x00", b"\x01\x02\x03", &[0x5a; 300]];
        for payload in payloads {
            let bytes = encode(6, 0x82, 1, payload).unwrap();
            let frame = decode(&bytes).unwrap();
            assert_eq!(
                frame.header,
                FrameHeader::new(6, 0x82, 1, payload.len() as u16)
            );
            assert_eq!(&frame.payload[..], payload);
        }
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut bytes = encode(6, 0x01, 0, b"abc").unwrap().to_vec();
        bytes.pop();
        assert!(matches!(decode(&bytes), Err(BtpError::Decode(_))));
        assert!(matches!(decode(&bytes[..3]), Err(BtpError::Decode(_))));
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let err = encode(6, 0x01, 0, &payload).unwrap_err();
        assert!(matches!(
            err,
            BtpError::PayloadTooLarge { len, max } if len == MAX_PAYLOAD_LEN + 1 && max == MAX_PAYLOAD_LEN
        ));
        assert!(encode(6, 0x01, 0, &payload[1..]).is_ok());
    }

    #[test]
    fn classification() {
        assert!(FrameHeader::new(6, 0x80, 0, 0).is_event());
        assert!(FrameHeader::new(6, 0xff, 0, 0).is_event());
        assert!(!FrameHeader::new(6, 0x7f, 0, 0).is_event());
        assert!(FrameHeader::new(6, OP_STATUS, 0, 1).is_status());
        assert!(!FrameHeader::new(6, OP_STATUS, 0, 1).is_event());
    }

    #[test]
    fn status_code_from_payload() {
        assert_eq!(StatusCode::from_payload(b"\x00"), StatusCode::Success);
        assert_eq!(StatusCode::from_payload(b"\x01"), StatusCode::Failed);
        assert_eq!(StatusCode::from_payload(b"\x02"), StatusCode::UnknownCommand);
        assert_eq!(StatusCode::from_payload(b"\x03"), StatusCode::NotReady);
        assert_eq!(StatusCode::from_payload(b"\x7f"), StatusCode::Other(0x7f));
        assert_eq!(StatusCode::from_payload(b""), StatusCode::Missing);
    }

    #[test]
    fn header_serializes() {
        let header = FrameHeader::new(6, 0x82, 0, 3);
        insta::assert_json_snapshot!(header, @r#"
        {
          "service_id": 6,
          "opcode": 130,
          "controller_index": 0,
          "payload_len": 3
        }
        "#);
    }
}
