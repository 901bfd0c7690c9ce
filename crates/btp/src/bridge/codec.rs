//! Streaming codec for BTP frames.
//!
//! Works over any AsyncRead/AsyncWrite (Unix sockets, TCP, pipes) through
//! `FramedRead`/`FramedWrite`.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{self, Frame, HEADER_LEN};
use crate::error::BtpError;

/// A decoded frame, or the rejection of one the stream could skip over.
///
/// Rejections travel in-band: a decoder error would pause `FramedRead` until
/// more bytes arrive, stranding frames already buffered behind the bad one.
pub type DecodedFrame = Result<Frame, BtpError>;

/// Decodes the 5-byte header + payload framing.
///
/// With a payload limit set, a frame announcing a larger payload is yielded
/// as a `Decode` rejection and its payload is discarded as it arrives, so the
/// next frame is still found at the right offset.
#[derive(Debug, Default)]
pub struct BtpCodec {
    max_payload_len: Option<usize>,
    /// Bytes of a rejected frame still to be thrown away.
    discard: usize,
}

impl BtpCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_payload_len(mut self, max: Option<usize>) -> Self {
        self.max_payload_len = max;
        self
    }

    fn skip_discarded(&mut self, src: &mut BytesMut) -> bool {
        if self.discard > 0 {
            let n = self.discard.min(src.len());
            src.advance(n);
            self.discard -= n;
        }
        self.discard == 0
    }
}

impl Decoder for BtpCodec {
    type Item = DecodedFrame;
    type Error = BtpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if !self.skip_discarded(src) {
            return Ok(None);
        }

        let Some(head) = src.first_chunk::<HEADER_LEN>() else {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        };
        let header = protocol::decode_header(head);
        let payload_len = header.payload_len as usize;

        if let Some(max) = self.max_payload_len
            && payload_len > max
        {
            src.advance(HEADER_LEN);
            self.discard = payload_len;
            self.skip_discarded(src);
            return Ok(Some(Err(BtpError::Decode(format!(
                "frame {:#04x}/{:#04x} announces {} payload bytes, limit is {}",
                header.service_id, header.opcode, payload_len, max
            )))));
        }

        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len).freeze();
        tracing::trace!(
            service = header.service_id,
            opcode = header.opcode,
            index = header.controller_index,
            len = payload_len,
            "Decoded frame"
        );
        Ok(Some(Ok(Frame { header, payload })))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None if src.is_empty() && self.discard == 0 => Ok(None),
            None => {
                tracing::debug!(buffered = src.len(), "Stream ended inside a frame");
                src.clear();
                self.discard = 0;
                Err(BtpError::ConnectionClosed)
            }
        }
    }
}

impl Encoder<Frame> for BtpCodec {
    type Error = BtpError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!(
            service = item.header.service_id,
            opcode = item.header.opcode,
            index = item.header.controller_index,
            len = item.payload.len(),
            "Encoding frame"
        );
        item.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{FrameHeader, encode};

    fn frame(service: u8, opcode: u8, payload: &[u8]) -> Frame {
        Frame::new(service, opcode, 0, payload.to_vec()).unwrap()
    }

    #[test]
    fn codec_roundtrip() {
        let mut codec = BtpCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(frame(6, 0x01, b"\x00\x01"), &mut buf).unwrap();
        codec.encode(frame(6, 0x82, b""), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(first.header, FrameHeader::new(6, 0x01, 0, 2));
        assert_eq!(&first.payload[..], b"\x00\x01");

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert!(second.is_event());
        assert!(second.payload.is_empty());

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn waits_for_partial_frame() {
        let mut codec = BtpCodec::new();
        let bytes = encode(2, 0x05, 1, b"hello").unwrap();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&bytes[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[3..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[7..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(&decoded.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn eof_inside_frame_is_connection_closed() {
        let mut codec = BtpCodec::new();
        let bytes = encode(2, 0x05, 1, b"hello").unwrap();
        let mut buf = BytesMut::from(&bytes[..6]);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, BtpError::ConnectionClosed));
    }

    #[test]
    fn eof_at_frame_boundary_is_clean() {
        let mut codec = BtpCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_skipped_and_stream_resyncs() {
        let mut codec = BtpCodec::new().with_max_payload_len(Some(4));
        let big = encode(6, 0x01, 0, &[0xee; 10]).unwrap();
        let good = encode(6, 0x02, 0, b"ok").unwrap();

        let mut buf = BytesMut::from(&big[..8]);
        let rejected = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(rejected, Err(BtpError::Decode(_))));
        assert!(buf.is_empty());

        // Remainder of the rejected payload arrives together with a good frame.
        buf.extend_from_slice(&big[8..]);
        buf.extend_from_slice(&good);
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded.header.opcode, 0x02);
        assert_eq!(&decoded.payload[..], b"ok");
    }
}
