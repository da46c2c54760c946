use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::ids::RequestId;
use crate::meta::MAX_FRAMES_PER_BODY;

/// Bytes of header preceding the payload: 16-byte id + 2-byte index.
pub const FRAME_HEADER_LEN: usize = 18;

/// One bounded binary unit on the data channel.
///
/// Wire layout: `[16-byte id][2-byte big-endian index][payload]`. A body is
/// a contiguous run of frames indexed `0..N-1`; only the final frame may be
/// shorter than the usable payload size.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub id: RequestId,
    pub index: u16,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("missing packet {0}")]
    MissingPacket(u16),
    #[error("binary frame of {0} bytes is shorter than the {FRAME_HEADER_LEN}-byte header")]
    Truncated(usize),
    #[error("max packet size {0} cannot hold the {FRAME_HEADER_LEN}-byte frame header")]
    PacketSizeTooSmall(usize),
    #[error("body of {0} bytes would span more than {MAX_FRAMES_PER_BODY} frames")]
    TooManyFrames(u64),
}

impl Frame {
    /// Bounds-checked header decode. The length is validated before any
    /// payload byte is touched.
    pub fn parse(data: Bytes) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated(data.len()));
        }
        let mut id = [0u8; RequestId::LEN];
        id.copy_from_slice(&data[..RequestId::LEN]);
        let index = u16::from_be_bytes([data[16], data[17]]);
        Ok(Self {
            id: RequestId::from_bytes(id),
            index,
            payload: data.slice(FRAME_HEADER_LEN..),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_slice(self.id.as_bytes());
        buf.put_u16(self.index);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

/// Split `body` into frames of at most `max_packet_size` bytes each.
///
/// An empty body yields no frames; a body whose length is an exact multiple
/// of the usable payload size ends with a full frame, never an empty one.
pub fn encode(id: RequestId, body: &Bytes, max_packet_size: usize) -> Result<Vec<Frame>, FrameError> {
    if max_packet_size <= FRAME_HEADER_LEN {
        return Err(FrameError::PacketSizeTooSmall(max_packet_size));
    }
    let usable = max_packet_size - FRAME_HEADER_LEN;
    let count = body.len().div_ceil(usable);
    if count as u64 > MAX_FRAMES_PER_BODY {
        return Err(FrameError::TooManyFrames(body.len() as u64));
    }

    let mut frames = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * usable;
        let end = usize::min(start + usable, body.len());
        frames.push(Frame {
            id,
            index: index as u16,
            payload: body.slice(start..end),
        });
    }
    Ok(frames)
}

/// Reassemble a complete frame set into the original body.
///
/// Frames may arrive in any order; indices must form a contiguous run from
/// zero. The first absent index is reported as `MissingPacket`.
pub fn decode(frames: &[Frame]) -> Result<Bytes, FrameError> {
    if frames.is_empty() {
        return Ok(Bytes::new());
    }

    let mut by_index: HashMap<u16, &Frame> = HashMap::with_capacity(frames.len());
    let mut max_index = 0u16;
    for frame in frames {
        max_index = max_index.max(frame.index);
        by_index.insert(frame.index, frame);
    }

    let mut body = BytesMut::new();
    for index in 0..=max_index {
        match by_index.get(&index) {
            Some(frame) => body.extend_from_slice(&frame.payload),
            None => return Err(FrameError::MissingPacket(index)),
        }
    }
    Ok(body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id() -> RequestId {
        RequestId::parse("0123456789abcdef0123456789abcdef").unwrap()
    }

    fn body_of(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    #[test]
    fn roundtrip_various_sizes() {
        for len in [0usize, 1, 18, 19, 1000, 100_000, 3_000_000] {
            for max_packet in [19usize, 64, 1500, 1_048_576] {
                let body = body_of(len);
                let frames = encode(test_id(), &body, max_packet).unwrap();
                assert_eq!(decode(&frames).unwrap(), body, "len={len} max={max_packet}");
            }
        }
    }

    #[test]
    fn empty_body_yields_no_frames() {
        let frames = encode(test_id(), &Bytes::new(), 1024).unwrap();
        assert!(frames.is_empty());
        assert_eq!(decode(&frames).unwrap(), Bytes::new());
    }

    #[test]
    fn two_megabyte_body_splits_into_two_frames() {
        let body = body_of(2_000_000);
        let frames = encode(test_id(), &body, 1_048_576).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].index, 0);
        assert_eq!(frames[0].payload.len(), 1_048_558);
        assert_eq!(frames[1].index, 1);
        assert_eq!(frames[1].payload.len(), 951_442);
    }

    #[test]
    fn exact_multiple_ends_with_full_frame() {
        let usable = 1024 - FRAME_HEADER_LEN;
        let body = body_of(usable * 3);
        let frames = encode(test_id(), &body, 1024).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].payload.len(), usable);
    }

    #[test]
    fn rejects_packet_size_that_fits_no_payload() {
        assert_eq!(
            encode(test_id(), &body_of(10), 18).unwrap_err(),
            FrameError::PacketSizeTooSmall(18)
        );
        assert!(encode(test_id(), &body_of(10), 19).is_ok());
    }

    #[test]
    fn rejects_bodies_beyond_the_index_space() {
        // usable = 1 byte per frame; 65 537 bytes would need 65 537 frames.
        let body = body_of(65_537);
        assert_eq!(
            encode(test_id(), &body, 19).unwrap_err(),
            FrameError::TooManyFrames(65_537)
        );
        assert!(encode(test_id(), &body_of(65_536), 19).is_ok());
    }

    #[test]
    fn decode_is_order_independent() {
        let body = body_of(10_000);
        let mut frames = encode(test_id(), &body, 1024).unwrap();
        frames.reverse();
        assert_eq!(decode(&frames).unwrap(), body);

        // an arbitrary permutation, not just reversal
        frames.swap(0, 7);
        frames.swap(3, 5);
        assert_eq!(decode(&frames).unwrap(), body);
    }

    #[test]
    fn decode_names_the_first_missing_index() {
        let body = body_of(10_000);
        let frames = encode(test_id(), &body, 1024).unwrap();
        assert!(frames.len() > 3);

        for removed in 0..frames.len() - 1 {
            let mut partial = frames.clone();
            partial.remove(removed);
            assert_eq!(
                decode(&partial).unwrap_err(),
                FrameError::MissingPacket(removed as u16),
                "removed frame {removed}"
            );
        }

        // A missing final frame is invisible to the codec (the run is still
        // contiguous); the byte-count check in the tracker guards that case.
        let mut partial = frames.clone();
        partial.pop();
        assert_ne!(decode(&partial).unwrap(), body);
    }

    #[test]
    fn wire_roundtrip_preserves_header_and_payload() {
        let frame = Frame {
            id: test_id(),
            index: 0x0102,
            payload: Bytes::from_static(b"payload"),
        };
        let raw = frame.to_bytes();
        assert_eq!(&raw[..16], test_id().as_bytes());
        assert_eq!(&raw[16..18], &[0x01, 0x02]);
        let parsed = Frame::parse(raw).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn parse_rejects_short_frames() {
        assert_eq!(
            Frame::parse(Bytes::from_static(&[0u8; 17])).unwrap_err(),
            FrameError::Truncated(17)
        );
        // exactly a header is a legal empty-payload frame
        let frame = Frame::parse(Bytes::from(vec![0u8; 18])).unwrap();
        assert!(frame.payload.is_empty());
    }
}
