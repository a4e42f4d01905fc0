//! Chunking and reassembly of large payloads over a size-limited
//! message channel.
//!
//! A logical message is split into Chunk records followed by one
//! Complete record, all sharing a sequence number:
//!
//! ```text
//! Chunk     0x01 | seq u32 | index u16 | data …
//! Complete  0x02 | seq u32 | total u16 | total u16 | bytes u32
//! ```
//!
//! All integers are little-endian. The Complete record carries the
//! chunk count twice (offsets 5 and 7); both are written and the
//! second is authoritative on read.

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::ChunkConfig;
use crate::error::CastError;
use crate::peer::PeerId;
use crate::transport::channel::DataChannel;

/// Record type tag for a Chunk record.
pub const CHUNK_TAG: u8 = 0x01;
/// Record type tag for a Complete record.
pub const COMPLETE_TAG: u8 = 0x02;
/// Header bytes in front of every Chunk record's data.
pub const CHUNK_HEADER_SIZE: usize = 7;
/// Largest chunk payload that keeps a Chunk record within a 16 KiB
/// data-channel message.
pub const MAX_CHUNK_DATA: usize = 16 * 1024 - CHUNK_HEADER_SIZE;
/// Exact size of a Complete record.
pub const COMPLETE_SIZE: usize = 13;

// ── ChunkRecord ──────────────────────────────────────────────────

/// One parsed record from the data channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkRecord {
    Chunk {
        sequence: u32,
        index: u16,
        data: Bytes,
    },
    Complete {
        sequence: u32,
        total_chunks: u16,
        total_bytes: u32,
    },
}

impl ChunkRecord {
    pub fn encode(&self) -> Bytes {
        match self {
            ChunkRecord::Chunk {
                sequence,
                index,
                data,
            } => {
                let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + data.len());
                buf.put_u8(CHUNK_TAG);
                buf.put_u32_le(*sequence);
                buf.put_u16_le(*index);
                buf.put_slice(data);
                buf.freeze()
            }
            ChunkRecord::Complete {
                sequence,
                total_chunks,
                total_bytes,
            } => {
                let mut buf = BytesMut::with_capacity(COMPLETE_SIZE);
                buf.put_u8(COMPLETE_TAG);
                buf.put_u32_le(*sequence);
                buf.put_u16_le(*total_chunks);
                buf.put_u16_le(*total_chunks);
                buf.put_u32_le(*total_bytes);
                buf.freeze()
            }
        }
    }

    /// Parse a record. Chunk data is a zero-copy slice of `raw`.
    pub fn decode(raw: &Bytes) -> Result<Self, CastError> {
        let Some(&tag) = raw.first() else {
            return Err(CastError::MalformedMessage("empty record"));
        };
        match tag {
            CHUNK_TAG => {
                if raw.len() < CHUNK_HEADER_SIZE {
                    return Err(CastError::MalformedMessage("chunk record shorter than header"));
                }
                let mut header = &raw[1..CHUNK_HEADER_SIZE];
                let sequence = header.get_u32_le();
                let index = header.get_u16_le();
                Ok(ChunkRecord::Chunk {
                    sequence,
                    index,
                    data: raw.slice(CHUNK_HEADER_SIZE..),
                })
            }
            COMPLETE_TAG => {
                if raw.len() < COMPLETE_SIZE {
                    return Err(CastError::MalformedMessage("complete record too short"));
                }
                let mut buf = &raw[1..COMPLETE_SIZE];
                let sequence = buf.get_u32_le();
                let _first_count = buf.get_u16_le();
                let total_chunks = buf.get_u16_le();
                let total_bytes = buf.get_u32_le();
                Ok(ChunkRecord::Complete {
                    sequence,
                    total_chunks,
                    total_bytes,
                })
            }
            _ => Err(CastError::MalformedMessage("unknown record type")),
        }
    }
}

// ── Reassembly ───────────────────────────────────────────────────

#[derive(Default)]
struct PendingMessage {
    chunks: BTreeMap<u16, Bytes>,
    /// `(total_chunks, total_bytes)` once the Complete record arrived.
    complete: Option<(u16, u32)>,
}

impl PendingMessage {
    fn is_whole(&self) -> bool {
        match self.complete {
            Some((total, _)) => (0..total).all(|i| self.chunks.contains_key(&i)),
            None => false,
        }
    }
}

/// Incomplete messages from one peer, oldest first.
#[derive(Default)]
struct ReassemblyState {
    messages: HashMap<u32, PendingMessage>,
    order: VecDeque<u32>,
}

impl ReassemblyState {
    fn entry(&mut self, sequence: u32, cap: usize) -> &mut PendingMessage {
        if !self.messages.contains_key(&sequence) {
            while self.order.len() >= cap {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.messages.remove(&oldest);
                debug!("evicted incomplete message {oldest}");
            }
            self.order.push_back(sequence);
        }
        self.messages.entry(sequence).or_default()
    }

    fn remove(&mut self, sequence: u32) -> Option<PendingMessage> {
        self.order.retain(|s| *s != sequence);
        self.messages.remove(&sequence)
    }
}

// ── ChunkTransport ───────────────────────────────────────────────

/// Sender-side sequencing and receiver-side reassembly for every peer.
pub struct ChunkTransport {
    config: ChunkConfig,
    /// Process-wide message counter shared by all peers. Wraps at
    /// `u32::MAX`.
    next_sequence: u32,
    peers: HashMap<PeerId, ReassemblyState>,
}

impl ChunkTransport {
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            config,
            next_sequence: 0,
            peers: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    fn chunk_size(&self) -> usize {
        self.config.chunk_size.max(1)
    }

    /// Split `payload` into Chunk records plus a Complete record and
    /// send them on `channel`. Returns the sequence number used.
    ///
    /// [`CastError::ChannelNotOpen`] and [`CastError::ChannelSaturated`]
    /// mean "try again later"; nothing was sent and no sequence number
    /// was consumed.
    pub fn send(&mut self, channel: &mut dyn DataChannel, payload: &[u8]) -> Result<u32, CastError> {
        if !channel.is_open() {
            return Err(CastError::ChannelNotOpen);
        }
        let buffered = channel.buffered_amount();
        if buffered > self.config.max_buffered {
            return Err(CastError::ChannelSaturated {
                buffered,
                max: self.config.max_buffered,
            });
        }

        let chunk_size = self.chunk_size();
        let max = (usize::from(u16::MAX) * chunk_size).min(u32::MAX as usize);
        if payload.len() > max {
            return Err(CastError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let mut total_chunks: u16 = 0;
        for (index, data) in payload.chunks(chunk_size).enumerate() {
            let record = ChunkRecord::Chunk {
                sequence,
                index: index as u16,
                data: Bytes::copy_from_slice(data),
            };
            channel.send(record.encode())?;
            total_chunks += 1;
        }

        let complete = ChunkRecord::Complete {
            sequence,
            total_chunks,
            total_bytes: payload.len() as u32,
        };
        channel.send(complete.encode())?;
        trace!(
            "sent message {sequence}: {} bytes in {total_chunks} chunks",
            payload.len()
        );
        Ok(sequence)
    }

    /// Process one record from `peer`. Returns the reassembled payload
    /// when this record completed a message.
    pub fn receive(&mut self, peer: &PeerId, raw: Bytes) -> Result<Option<Bytes>, CastError> {
        let record = ChunkRecord::decode(&raw)?;
        let cap = self.config.max_pending_messages.max(1);
        let state = self.peers.entry(peer.clone()).or_default();

        let sequence = match record {
            ChunkRecord::Chunk {
                sequence,
                index,
                data,
            } => {
                let pending = state.entry(sequence, cap);
                pending.chunks.insert(index, data);
                if pending.complete.is_none() {
                    return Ok(None);
                }
                sequence
            }
            ChunkRecord::Complete {
                sequence,
                total_chunks,
                total_bytes,
            } => {
                let pending = state.entry(sequence, cap);
                pending.complete = Some((total_chunks, total_bytes));
                sequence
            }
        };

        let whole = state
            .messages
            .get(&sequence)
            .is_some_and(PendingMessage::is_whole);
        if !whole {
            trace!("message {sequence} from {peer} still has gaps");
            return Ok(None);
        }

        let Some(message) = state.remove(sequence) else {
            return Ok(None);
        };
        let Some((total_chunks, total_bytes)) = message.complete else {
            return Ok(None);
        };

        let mut buf = BytesMut::with_capacity(total_bytes as usize);
        for data in message.chunks.range(..total_chunks).map(|(_, d)| d) {
            buf.put_slice(data);
        }
        if buf.len() != total_bytes as usize {
            warn!(
                "message {sequence} from {peer}: reassembled {} bytes, expected {total_bytes}",
                buf.len()
            );
            return Err(CastError::MalformedMessage("reassembled length mismatch"));
        }
        Ok(Some(buf.freeze()))
    }

    /// Drop every incomplete message from `peer`.
    pub fn release_peer(&mut self, peer: &PeerId) {
        if let Some(state) = self.peers.remove(peer) {
            if !state.messages.is_empty() {
                debug!(
                    "discarded {} incomplete messages from {peer}",
                    state.messages.len()
                );
            }
        }
    }

    /// Incomplete messages currently held for `peer`.
    pub fn pending(&self, peer: &PeerId) -> usize {
        self.peers.get(peer).map_or(0, |s| s.messages.len())
    }

    /// Whether any reassembly state exists for `peer`.
    pub fn tracks(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every message; open and buffer level are scriptable.
    struct RecordingChannel {
        open: bool,
        buffered: usize,
        sent: Vec<Bytes>,
    }

    impl RecordingChannel {
        fn open() -> Self {
            Self {
                open: true,
                buffered: 0,
                sent: Vec::new(),
            }
        }
    }

    impl DataChannel for RecordingChannel {
        fn label(&self) -> &str {
            "test"
        }
        fn is_open(&self) -> bool {
            self.open
        }
        fn buffered_amount(&self) -> usize {
            self.buffered
        }
        fn send(&mut self, message: Bytes) -> Result<(), CastError> {
            self.sent.push(message);
            Ok(())
        }
        fn close(&mut self) {
            self.open = false;
        }
    }

    fn payload(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn forty_thousand_bytes_in_three_chunks() {
        let mut tx = ChunkTransport::new(ChunkConfig::default());
        let mut ch = RecordingChannel::open();
        let data = payload(40_000);
        let seq = tx.send(&mut ch, &data).unwrap();

        assert_eq!(ch.sent.len(), 4);
        let sizes: Vec<usize> = ch.sent[..3]
            .iter()
            .map(|r| r.len() - CHUNK_HEADER_SIZE)
            .collect();
        assert_eq!(sizes, vec![16384, 16384, 7232]);
        assert_eq!(
            ChunkRecord::decode(&ch.sent[3]).unwrap(),
            ChunkRecord::Complete {
                sequence: seq,
                total_chunks: 3,
                total_bytes: 40_000,
            }
        );

        // Out-of-order chunks, then Complete.
        let mut rx = ChunkTransport::new(ChunkConfig::default());
        let peer = PeerId::from("p");
        for i in [2, 0, 1] {
            assert!(rx.receive(&peer, ch.sent[i].clone()).unwrap().is_none());
        }
        let out = rx.receive(&peer, ch.sent[3].clone()).unwrap().unwrap();
        assert_eq!(out.as_ref(), data.as_slice());
        assert_eq!(rx.pending(&peer), 0);
    }

    #[test]
    fn complete_record_layout() {
        let raw = ChunkRecord::Complete {
            sequence: 0x0102_0304,
            total_chunks: 3,
            total_bytes: 40_000,
        }
        .encode();
        assert_eq!(raw.len(), COMPLETE_SIZE);
        assert_eq!(raw[0], COMPLETE_TAG);
        assert_eq!(&raw[1..5], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&raw[5..7], &3u16.to_le_bytes());
        assert_eq!(&raw[7..9], &3u16.to_le_bytes());
        assert_eq!(&raw[9..13], &40_000u32.to_le_bytes());
    }

    #[test]
    fn chunk_record_layout() {
        let raw = ChunkRecord::Chunk {
            sequence: 7,
            index: 2,
            data: Bytes::from_static(b"xyz"),
        }
        .encode();
        assert_eq!(raw.as_ref(), &[0x01, 7, 0, 0, 0, 2, 0, b'x', b'y', b'z']);
    }

    #[test]
    fn receiver_reads_second_count_slot() {
        let mut raw = BytesMut::new();
        raw.put_u8(COMPLETE_TAG);
        raw.put_u32_le(9);
        raw.put_u16_le(0xFFFF);
        raw.put_u16_le(0);
        raw.put_u32_le(0);
        let mut rx = ChunkTransport::new(ChunkConfig::default());
        let out = rx.receive(&PeerId::from("p"), raw.freeze()).unwrap();
        assert_eq!(out.unwrap().len(), 0);
    }

    #[test]
    fn empty_payload_round_trip() {
        let mut tx = ChunkTransport::new(ChunkConfig::default());
        let mut ch = RecordingChannel::open();
        tx.send(&mut ch, &[]).unwrap();
        assert_eq!(ch.sent.len(), 1, "only a Complete record");

        let mut rx = ChunkTransport::new(ChunkConfig::default());
        let out = rx.receive(&PeerId::from("p"), ch.sent[0].clone()).unwrap();
        assert_eq!(out, Some(Bytes::new()));
    }

    #[test]
    fn assorted_sizes_reassemble() {
        let config = ChunkConfig {
            chunk_size: 1000,
            ..Default::default()
        };
        let mut tx = ChunkTransport::new(config.clone());
        let mut rx = ChunkTransport::new(config);
        let peer = PeerId::from("p");
        for n in [1, 999, 1000, 1001, 5000, 123_457] {
            let mut ch = RecordingChannel::open();
            let data = payload(n);
            tx.send(&mut ch, &data).unwrap();
            let mut out = None;
            for record in ch.sent {
                out = rx.receive(&peer, record).unwrap();
            }
            assert_eq!(out.unwrap().as_ref(), data.as_slice(), "size {n}");
        }
    }

    #[test]
    fn large_payload_reassembles() {
        let mut tx = ChunkTransport::new(ChunkConfig::default());
        let mut rx = ChunkTransport::new(ChunkConfig::default());
        let mut ch = RecordingChannel::open();
        let data = payload(10_000_000);
        tx.send(&mut ch, &data).unwrap();
        assert_eq!(ch.sent.len(), 10_000_000usize.div_ceil(16384) + 1);

        let peer = PeerId::from("p");
        let mut out = None;
        for record in ch.sent {
            out = rx.receive(&peer, record).unwrap();
        }
        assert_eq!(out.unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn partial_delivery_yields_nothing_until_gap_filled() {
        let mut tx = ChunkTransport::new(ChunkConfig {
            chunk_size: 4,
            ..Default::default()
        });
        let mut ch = RecordingChannel::open();
        tx.send(&mut ch, b"0123456789").unwrap();

        let mut rx = ChunkTransport::new(ChunkConfig::default());
        let peer = PeerId::from("p");
        rx.receive(&peer, ch.sent[0].clone()).unwrap();
        rx.receive(&peer, ch.sent[2].clone()).unwrap();
        assert!(rx.receive(&peer, ch.sent[3].clone()).unwrap().is_none());
        assert_eq!(rx.pending(&peer), 1);

        let out = rx.receive(&peer, ch.sent[1].clone()).unwrap();
        assert_eq!(out.unwrap().as_ref(), b"0123456789");
        assert_eq!(rx.pending(&peer), 0);
    }

    #[test]
    fn closed_or_saturated_channel_refuses_without_consuming_sequence() {
        let mut tx = ChunkTransport::new(ChunkConfig::default());
        let mut ch = RecordingChannel::open();
        ch.open = false;
        assert!(matches!(tx.send(&mut ch, b"x"), Err(CastError::ChannelNotOpen)));

        ch.open = true;
        ch.buffered = 5 * 1024 * 1024 + 1;
        let err = tx.send(&mut ch, b"x").unwrap_err();
        assert!(matches!(err, CastError::ChannelSaturated { .. }));
        assert!(err.is_transient());
        assert!(ch.sent.is_empty());

        ch.buffered = 5 * 1024 * 1024;
        assert_eq!(tx.send(&mut ch, b"x").unwrap(), 0);
    }

    #[test]
    fn sequence_is_shared_across_peers() {
        let mut tx = ChunkTransport::new(ChunkConfig::default());
        let mut a = RecordingChannel::open();
        let mut b = RecordingChannel::open();
        assert_eq!(tx.send(&mut a, b"1").unwrap(), 0);
        assert_eq!(tx.send(&mut b, b"2").unwrap(), 1);
        assert_eq!(tx.send(&mut a, b"3").unwrap(), 2);
    }

    #[test]
    fn sequence_wraps_at_u32_max() {
        let mut tx = ChunkTransport::new(ChunkConfig::default());
        tx.next_sequence = u32::MAX;
        let mut ch = RecordingChannel::open();
        assert_eq!(tx.send(&mut ch, b"a").unwrap(), u32::MAX);
        assert_eq!(tx.send(&mut ch, b"b").unwrap(), 0);
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut tx = ChunkTransport::new(ChunkConfig {
            chunk_size: 1,
            ..Default::default()
        });
        let mut ch = RecordingChannel::open();
        let err = tx.send(&mut ch, &vec![0; 70_000]).unwrap_err();
        assert!(matches!(err, CastError::PayloadTooLarge { size: 70_000, .. }));
        assert!(ch.sent.is_empty());
    }

    #[test]
    fn malformed_records_rejected() {
        let mut rx = ChunkTransport::new(ChunkConfig::default());
        let peer = PeerId::from("p");
        for raw in [
            Bytes::new(),
            Bytes::from_static(&[0x01, 0, 0]),
            Bytes::from_static(&[0x02, 0, 0, 0, 0, 1, 0]),
            Bytes::from_static(&[0x07, 0, 0, 0, 0, 0, 0]),
        ] {
            let err = rx.receive(&peer, raw).unwrap_err();
            assert!(matches!(err, CastError::MalformedMessage(_)));
        }
    }

    #[test]
    fn length_mismatch_drops_message() {
        let mut rx = ChunkTransport::new(ChunkConfig::default());
        let peer = PeerId::from("p");
        let chunk = ChunkRecord::Chunk {
            sequence: 1,
            index: 0,
            data: Bytes::from_static(b"abc"),
        };
        let complete = ChunkRecord::Complete {
            sequence: 1,
            total_chunks: 1,
            total_bytes: 4,
        };
        rx.receive(&peer, chunk.encode()).unwrap();
        assert!(rx.receive(&peer, complete.encode()).is_err());
        assert_eq!(rx.pending(&peer), 0);
    }

    #[test]
    fn pending_messages_are_capped() {
        let mut rx = ChunkTransport::new(ChunkConfig {
            max_pending_messages: 2,
            ..Default::default()
        });
        let peer = PeerId::from("p");
        for seq in 0..3 {
            let chunk = ChunkRecord::Chunk {
                sequence: seq,
                index: 0,
                data: Bytes::from_static(b"x"),
            };
            rx.receive(&peer, chunk.encode()).unwrap();
        }
        assert_eq!(rx.pending(&peer), 2);

        // Sequence 0 was evicted; its Complete now waits for a chunk.
        let complete = ChunkRecord::Complete {
            sequence: 0,
            total_chunks: 1,
            total_bytes: 1,
        };
        assert!(rx.receive(&peer, complete.encode()).unwrap().is_none());
    }

    #[test]
    fn peers_are_independent_and_released() {
        let mut rx = ChunkTransport::new(ChunkConfig::default());
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        let chunk = ChunkRecord::Chunk {
            sequence: 5,
            index: 0,
            data: Bytes::from_static(b"x"),
        }
        .encode();
        rx.receive(&a, chunk.clone()).unwrap();
        rx.receive(&b, chunk).unwrap();

        rx.release_peer(&a);
        assert!(!rx.tracks(&a));
        assert_eq!(rx.pending(&b), 1);

        let complete = ChunkRecord::Complete {
            sequence: 5,
            total_chunks: 1,
            total_bytes: 1,
        };
        assert_eq!(rx.receive(&b, complete.encode()).unwrap().unwrap().as_ref(), b"x");
    }
}
