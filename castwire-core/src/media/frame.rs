//! Binary serialization of [`EncodedFrame`] records.
//!
//! ## Wire format
//!
//! **Frame header** (32 bytes, little-endian):
//! ```text
//! kind:          u32  (4)   0 = video, 1 = audio, 2 = config
//! timestamp:     f64  (8)
//! duration:      f64  (8)   0 = absent
//! flags:         u32  (4)   bit 0 = key frame
//! codec_len:     u32  (4)   0 = absent
//! width:         u16  (2)   0 = absent
//! height:        u16  (2)   0 = absent
//! ```
//! followed by `codec_len` bytes of UTF-8 codec identifier and then the
//! payload (media bytes, or the config's extra data) up to the end of
//! the buffer.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CastError;
use crate::media::types::{EncodedFrame, MediaFrame, StreamConfig};

bitflags! {
    /// Per-frame flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u32 {
        const KEY_FRAME = 0x1;
    }
}

// ── FrameKind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameKind {
    Video = 0,
    Audio = 1,
    Config = 2,
}

impl TryFrom<u32> for FrameKind {
    type Error = CastError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Video),
            1 => Ok(FrameKind::Audio),
            2 => Ok(FrameKind::Config),
            _ => Err(CastError::MalformedFrame("unknown frame kind")),
        }
    }
}

// ── FrameHeader ──────────────────────────────────────────────────

/// Fixed-size header preceding every serialized frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub timestamp: f64,
    pub duration: f64,
    pub flags: FrameFlags,
    pub codec_len: u32,
    pub width: u16,
    pub height: u16,
}

impl FrameHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 32;

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[4..12].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[12..20].copy_from_slice(&self.duration.to_le_bytes());
        buf[20..24].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[24..28].copy_from_slice(&self.codec_len.to_le_bytes());
        buf[28..30].copy_from_slice(&self.width.to_le_bytes());
        buf[30..32].copy_from_slice(&self.height.to_le_bytes());
        buf
    }

    /// Deserialize from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, CastError> {
        let h: &[u8; Self::SIZE] = data
            .get(..Self::SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or(CastError::MalformedFrame("buffer shorter than frame header"))?;

        Ok(Self {
            kind: FrameKind::try_from(u32::from_le_bytes([h[0], h[1], h[2], h[3]]))?,
            timestamp: f64::from_le_bytes([h[4], h[5], h[6], h[7], h[8], h[9], h[10], h[11]]),
            duration: f64::from_le_bytes([
                h[12], h[13], h[14], h[15], h[16], h[17], h[18], h[19],
            ]),
            flags: FrameFlags::from_bits_truncate(u32::from_le_bytes([h[20], h[21], h[22], h[23]])),
            codec_len: u32::from_le_bytes([h[24], h[25], h[26], h[27]]),
            width: u16::from_le_bytes([h[28], h[29]]),
            height: u16::from_le_bytes([h[30], h[31]]),
        })
    }
}

// ── serialize / deserialize ──────────────────────────────────────

/// Serialize a frame record into a single contiguous buffer.
pub fn serialize(frame: &EncodedFrame) -> Bytes {
    let (header, codec, payload) = match frame {
        EncodedFrame::Video(m) | EncodedFrame::Audio(m) => {
            let kind = if matches!(frame, EncodedFrame::Video(_)) {
                FrameKind::Video
            } else {
                FrameKind::Audio
            };
            let mut flags = FrameFlags::empty();
            flags.set(FrameFlags::KEY_FRAME, m.key_frame);
            let header = FrameHeader {
                kind,
                timestamp: m.timestamp as f64,
                duration: m.duration.unwrap_or(0) as f64,
                flags,
                codec_len: 0,
                width: 0,
                height: 0,
            };
            (header, &[][..], &m.payload)
        }
        EncodedFrame::Config(c) => {
            let codec = c.codec.as_deref().unwrap_or("").as_bytes();
            let header = FrameHeader {
                kind: FrameKind::Config,
                timestamp: c.timestamp as f64,
                duration: 0.0,
                flags: FrameFlags::empty(),
                codec_len: codec.len() as u32,
                width: c.coded_width.unwrap_or(0),
                height: c.coded_height.unwrap_or(0),
            };
            (header, codec, &c.extra_data)
        }
    };

    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + codec.len() + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(codec);
    buf.put_slice(payload);
    buf.freeze()
}

/// Parse a buffer produced by [`serialize`].
///
/// Zero sentinels on the wire are restored to `None`. The payload is a
/// zero-copy slice of `data`.
pub fn deserialize(data: &Bytes) -> Result<EncodedFrame, CastError> {
    let header = FrameHeader::decode(data)?;

    if !header.timestamp.is_finite() || !header.duration.is_finite() {
        return Err(CastError::MalformedFrame("non-finite timestamp or duration"));
    }

    let codec_end = FrameHeader::SIZE
        .checked_add(header.codec_len as usize)
        .filter(|end| *end <= data.len())
        .ok_or(CastError::MalformedFrame("codec length exceeds buffer"))?;
    let payload = data.slice(codec_end..);

    let timestamp = header.timestamp as i64;
    let frame = match header.kind {
        FrameKind::Video | FrameKind::Audio => {
            let media = MediaFrame {
                timestamp,
                duration: (header.duration != 0.0).then_some(header.duration as i64),
                key_frame: header.flags.contains(FrameFlags::KEY_FRAME),
                payload,
            };
            if header.kind == FrameKind::Video {
                EncodedFrame::Video(media)
            } else {
                EncodedFrame::Audio(media)
            }
        }
        FrameKind::Config => {
            let codec = std::str::from_utf8(&data[FrameHeader::SIZE..codec_end])
                .map_err(|_| CastError::MalformedFrame("codec identifier is not utf-8"))?;
            EncodedFrame::Config(StreamConfig {
                timestamp,
                codec: (!codec.is_empty()).then(|| codec.to_string()),
                coded_width: (header.width != 0).then_some(header.width),
                coded_height: (header.height != 0).then_some(header.height),
                extra_data: payload,
            })
        }
    };

    Ok(frame)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn video(ts: i64, key: bool, payload: &'static [u8]) -> EncodedFrame {
        EncodedFrame::Video(MediaFrame {
            timestamp: ts,
            duration: Some(33_333),
            key_frame: key,
            payload: Bytes::from_static(payload),
        })
    }

    #[test]
    fn header_layout_is_little_endian() {
        let bytes = serialize(&EncodedFrame::Config(StreamConfig {
            timestamp: 1_000,
            codec: Some("vp8".into()),
            coded_width: Some(1280),
            coded_height: Some(720),
            extra_data: Bytes::new(),
        }));

        assert_eq!(bytes.len(), FrameHeader::SIZE + 3);
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[4..12], &1000f64.to_le_bytes());
        assert_eq!(&bytes[12..20], &0f64.to_le_bytes());
        assert_eq!(&bytes[24..28], &3u32.to_le_bytes());
        assert_eq!(&bytes[28..30], &1280u16.to_le_bytes());
        assert_eq!(&bytes[30..32], &720u16.to_le_bytes());
        assert_eq!(&bytes[32..], b"vp8");
    }

    #[test]
    fn key_flag_is_bit_zero() {
        let bytes = serialize(&video(5, true, b"abc"));
        assert_eq!(&bytes[20..24], &1u32.to_le_bytes());
        let bytes = serialize(&video(5, false, b"abc"));
        assert_eq!(&bytes[20..24], &0u32.to_le_bytes());
    }

    #[test]
    fn video_and_audio_roundtrip() {
        let v = video(123_456, true, b"\x00\x00\x00\x01frame");
        assert_eq!(deserialize(&serialize(&v)).unwrap(), v);

        let a = EncodedFrame::Audio(MediaFrame {
            timestamp: 20_000,
            duration: None,
            key_frame: false,
            payload: Bytes::from_static(b"opus"),
        });
        assert_eq!(deserialize(&serialize(&a)).unwrap(), a);
    }

    #[test]
    fn absent_fields_normalize_to_none() {
        let cfg = EncodedFrame::Config(StreamConfig {
            timestamp: 0,
            codec: None,
            coded_width: None,
            coded_height: None,
            extra_data: Bytes::from_static(b"desc"),
        });
        let back = deserialize(&serialize(&cfg)).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn empty_codec_string_reads_back_as_none() {
        let cfg = EncodedFrame::Config(StreamConfig {
            timestamp: 7,
            codec: Some(String::new()),
            coded_width: Some(10),
            coded_height: Some(10),
            extra_data: Bytes::new(),
        });
        match deserialize(&serialize(&cfg)).unwrap() {
            EncodedFrame::Config(c) => assert!(c.codec.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_buffer_is_malformed() {
        let short = Bytes::from_static(&[0u8; 20]);
        assert!(matches!(deserialize(&short), Err(CastError::MalformedFrame(_))));
    }

    #[test]
    fn codec_length_past_end_is_malformed() {
        let mut bytes = serialize(&video(1, false, b"xy")).to_vec();
        bytes[24..28].copy_from_slice(&100u32.to_le_bytes());
        assert!(matches!(
            deserialize(&Bytes::from(bytes)),
            Err(CastError::MalformedFrame(_))
        ));
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let mut bytes = serialize(&video(1, false, b"")).to_vec();
        bytes[0..4].copy_from_slice(&9u32.to_le_bytes());
        assert!(deserialize(&Bytes::from(bytes)).is_err());
    }

    #[test]
    fn payload_is_zero_copy_slice() {
        let wire = serialize(&video(1, false, b"payload"));
        match deserialize(&wire).unwrap() {
            EncodedFrame::Video(m) => {
                assert_eq!(m.payload.as_ptr(), wire[FrameHeader::SIZE..].as_ptr());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
