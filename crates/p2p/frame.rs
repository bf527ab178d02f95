//! Frame codec for the TCP transport.
//!
//! Every frame starts with a fixed 20-byte big-endian header:
//!
//! ```text
//! magic (4) | version (2) | compress_type (1) | packet_type (1)
//!           | packet_id (4) | packet_size (4) | body_size (4) | body
//! ```
//!
//! A logical packet whose payload exceeds the frame-body ceiling is split
//! into chunks sharing the same `packet_id` and `packet_size`; a frame is
//! chunked iff `body_size < packet_size`. The magic number lets the decoder
//! silently re-align after upstream bit slips instead of tearing the whole
//! connection down.

use crate::{
    error::NetError,
    message::Message,
    session::TrafficStats,
};
use bytes::{Buf, BufMut, BytesMut};
use snap::raw::{Decoder as SnappyDecoder, Encoder as SnappyEncoder, max_compress_len};
use std::{collections::HashMap, sync::Arc};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// `"XDAG"` in ASCII.
pub const FRAME_MAGIC: u32 = 0x5844_4147;
pub const FRAME_VERSION: u16 = 1;
pub const FRAME_HEADER_SIZE: usize = 20;

const COMPRESS_NONE: u8 = 0;
const COMPRESS_SNAPPY: u8 = 1;

/// Ceiling on concurrently reassembling packets per connection. Overflow
/// clears every aggregate, which bounds memory against peers that open
/// chunked packets and never finish them.
const MAX_INFLIGHT_PACKETS: usize = 64;

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    version: u16,
    compress_type: u8,
    packet_type: u8,
    packet_id: u32,
    packet_size: u32,
    body_size: u32,
}

fn parse_header(raw: &[u8]) -> (u32, FrameHeader) {
    let magic = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let header = FrameHeader {
        version: u16::from_be_bytes([raw[4], raw[5]]),
        compress_type: raw[6],
        packet_type: raw[7],
        packet_id: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
        packet_size: u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]),
        body_size: u32::from_be_bytes([raw[16], raw[17], raw[18], raw[19]]),
    };
    (magic, header)
}

/// Partially reassembled chunked packet.
struct PendingPacket {
    compress_type: u8,
    packet_type: u8,
    packet_size: usize,
    remaining: usize,
    collected: Vec<u8>,
}

pub struct FrameCodec {
    max_frame_body_size: usize,
    max_packet_size: usize,
    compress: bool,
    next_packet_id: u32,
    pending: HashMap<u32, PendingPacket>,
    stats: Option<Arc<TrafficStats>>,
}

impl FrameCodec {
    pub fn new(max_frame_body_size: usize, max_packet_size: usize, compress: bool) -> Self {
        Self {
            max_frame_body_size,
            max_packet_size,
            compress,
            next_packet_id: 0,
            pending: HashMap::new(),
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<TrafficStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Discards bytes from the front of `src` until it either starts with
    /// the magic again or runs out of scannable data. Keeps the last three
    /// bytes around since they may be the prefix of a magic that has not
    /// fully arrived yet.
    fn resync(&self, src: &mut BytesMut) {
        let window = src.len().min(1 + self.max_frame_body_size);
        let magic = FRAME_MAGIC.to_be_bytes();
        match src[1..window].windows(4).position(|w| w == magic.as_slice()) {
            Some(pos) => {
                debug!(skipped = 1 + pos, "Re-synchronized frame stream on magic");
                src.advance(1 + pos);
            }
            None => {
                src.advance(window.saturating_sub(3).max(1));
            }
        }
    }

    fn decompress(&self, compress_type: u8, data: Vec<u8>) -> Result<Vec<u8>, NetError> {
        let data = match compress_type {
            COMPRESS_NONE => data,
            COMPRESS_SNAPPY => SnappyDecoder::new()
                .decompress_vec(&data)
                .map_err(|e| NetError::MalformedFraming(format!("snappy: {e}")))?,
            other => {
                return Err(NetError::MalformedFraming(format!(
                    "unknown compress type {other}"
                )));
            }
        };
        if data.len() > self.max_packet_size {
            return Err(NetError::PayloadTooLarge {
                size: data.len(),
                limit: self.max_packet_size,
            });
        }
        Ok(data)
    }

    /// Folds one frame body into the reassembly state, emitting the decoded
    /// message once the packet is complete.
    fn take_frame(
        &mut self,
        header: FrameHeader,
        body: Vec<u8>,
    ) -> Result<Option<Message>, NetError> {
        let packet_size = header.packet_size as usize;
        let body_size = body.len();

        if body_size > packet_size {
            return Err(NetError::MalformedFraming(format!(
                "frame body of {body_size} bytes exceeds its packet size of {packet_size}"
            )));
        }

        if body_size == packet_size {
            // Not chunked.
            let data = self.decompress(header.compress_type, body)?;
            return Ok(Some(Message::decode(header.packet_type, &data)?));
        }

        if packet_size > self.max_packet_size {
            return Err(NetError::PayloadTooLarge {
                size: packet_size,
                limit: self.max_packet_size,
            });
        }

        let entry = self
            .pending
            .entry(header.packet_id)
            .or_insert_with(|| PendingPacket {
                compress_type: header.compress_type,
                packet_type: header.packet_type,
                packet_size,
                remaining: packet_size,
                collected: Vec::with_capacity(packet_size.min(self.max_frame_body_size * 4)),
            });

        if entry.packet_size != packet_size
            || entry.compress_type != header.compress_type
            || entry.packet_type != header.packet_type
        {
            self.pending.remove(&header.packet_id);
            return Err(NetError::MalformedFraming(
                "chunk header disagrees with its packet aggregate".into(),
            ));
        }

        if body_size > entry.remaining {
            self.pending.remove(&header.packet_id);
            return Err(NetError::MalformedFraming(
                "chunked packet received more bytes than announced".into(),
            ));
        }

        entry.collected.extend_from_slice(&body);
        entry.remaining -= body_size;

        if entry.remaining == 0 {
            let done = self
                .pending
                .remove(&header.packet_id)
                .unwrap_or_else(|| unreachable!("aggregate was just updated"));
            let data = self.decompress(done.compress_type, done.collected)?;
            return Ok(Some(Message::decode(done.packet_type, &data)?));
        }

        if self.pending.len() > MAX_INFLIGHT_PACKETS {
            warn!(
                aggregates = self.pending.len(),
                "Too many in-flight chunked packets, dropping all of them"
            );
            self.pending.clear();
        }

        Ok(None)
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < FRAME_HEADER_SIZE {
                src.reserve(FRAME_HEADER_SIZE - src.len());
                return Ok(None);
            }

            let (magic, header) = parse_header(&src[..FRAME_HEADER_SIZE]);

            if magic != FRAME_MAGIC {
                self.resync(src);
                continue;
            }

            if header.version != FRAME_VERSION
                || header.body_size as usize > self.max_frame_body_size
            {
                debug!(
                    version = header.version,
                    body_size = header.body_size,
                    "Dropping frame with bad version or body size, re-syncing"
                );
                // Step past the first magic byte; the next iteration falls
                // into the resync scan.
                src.advance(1);
                continue;
            }

            let body_size = header.body_size as usize;
            if src.len() < FRAME_HEADER_SIZE + body_size {
                src.reserve(FRAME_HEADER_SIZE + body_size - src.len());
                return Ok(None);
            }

            src.advance(FRAME_HEADER_SIZE);
            let body = src.split_to(body_size).to_vec();

            if let Some(stats) = &self.stats {
                stats.record_frame_in(FRAME_HEADER_SIZE + body_size);
            }

            match self.take_frame(header, body)? {
                Some(message) => return Ok(Some(message)),
                // The frame fed an incomplete aggregate; keep going in case
                // the buffer already holds its siblings.
                None => continue,
            }
        }
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = NetError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let packet_type = item.code();
        let mut payload = Vec::new();
        item.encode_payload(&mut payload);

        let (compress_type, data) = if self.compress {
            (COMPRESS_SNAPPY, snappy_compress(payload)?)
        } else {
            (COMPRESS_NONE, payload)
        };

        // The counter advances on every encode attempt, even ones that are
        // about to fail the size check.
        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);

        if data.len() > self.max_packet_size {
            return Err(NetError::PayloadTooLarge {
                size: data.len(),
                limit: self.max_packet_size,
            });
        }

        let packet_size = data.len() as u32;

        let mut write_frame = |chunk: &[u8], dst: &mut BytesMut| {
            dst.reserve(FRAME_HEADER_SIZE + chunk.len());
            dst.put_u32(FRAME_MAGIC);
            dst.put_u16(FRAME_VERSION);
            dst.put_u8(compress_type);
            dst.put_u8(packet_type);
            dst.put_u32(packet_id);
            dst.put_u32(packet_size);
            dst.put_u32(chunk.len() as u32);
            dst.put_slice(chunk);
            if let Some(stats) = &self.stats {
                stats.record_frame_out(FRAME_HEADER_SIZE + chunk.len());
            }
        };

        if data.is_empty() {
            write_frame(&[], dst);
        } else {
            for chunk in data.chunks(self.max_frame_body_size) {
                write_frame(chunk, dst);
            }
        }

        Ok(())
    }
}

fn snappy_compress(data: Vec<u8>) -> Result<Vec<u8>, NetError> {
    let mut compressed = vec![0; max_compress_len(data.len()) + 1];
    let size = SnappyEncoder::new()
        .compress(&data, &mut compressed)
        .map_err(|e| NetError::EncodeFailed(e.to_string()))?;
    compressed.truncate(size);
    Ok(compressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ApplicationMessage;
    use bytes::Bytes;

    const TEST_MAX_PACKET: usize = 4 * 1024 * 1024;

    fn codec(max_frame_body: usize) -> FrameCodec {
        FrameCodec::new(max_frame_body, TEST_MAX_PACKET, false)
    }

    fn app_message(payload: &[u8]) -> Message {
        Message::Application(ApplicationMessage::new(0x33, Bytes::copy_from_slice(payload)))
    }

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = codec.decode(buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn single_frame_round_trip() {
        let mut codec = codec(1024);
        let msg = app_message(b"hello frame");

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 11);

        assert_eq!(decode_all(&mut codec, &mut buf), vec![msg]);
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload_round_trip() {
        let mut codec = codec(1024);
        let msg = app_message(b"");
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(decode_all(&mut codec, &mut buf), vec![msg]);
    }

    #[test]
    fn body_at_the_ceiling_is_a_single_frame() {
        let mut codec = codec(8);
        let mut buf = BytesMut::new();
        codec.encode(app_message(&[0xaa; 8]), &mut buf).unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 8);

        let mut buf = BytesMut::new();
        codec.encode(app_message(&[0xaa; 9]), &mut buf).unwrap();
        assert_eq!(buf.len(), 2 * FRAME_HEADER_SIZE + 9);
    }

    #[test]
    fn chunked_round_trip_at_every_split() {
        let payload: Vec<u8> = (0..=40u8).collect();
        for max_body in 1..=payload.len() + 1 {
            let mut codec = codec(max_body);
            let msg = app_message(&payload);
            let mut buf = BytesMut::new();
            codec.encode(msg.clone(), &mut buf).unwrap();
            assert_eq!(
                decode_all(&mut codec, &mut buf),
                vec![msg],
                "failed for max_frame_body = {max_body}"
            );
        }
    }

    #[test]
    fn compressed_round_trip() {
        let mut codec = FrameCodec::new(64, TEST_MAX_PACKET, true);
        // Highly compressible payload spanning several chunks even after
        // compression would fit one.
        let msg = app_message(&[7u8; 4096]);
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(decode_all(&mut codec, &mut buf), vec![msg]);
    }

    #[test]
    fn oversized_payload_is_rejected_on_encode() {
        let mut codec = FrameCodec::new(1024, 16, false);
        let mut buf = BytesMut::new();
        let err = codec.encode(app_message(&[0; 17]), &mut buf).unwrap_err();
        assert!(matches!(err, NetError::PayloadTooLarge { size: 17, limit: 16 }));
        assert!(buf.is_empty());

        // The rejected attempt still consumed a packet id.
        codec.encode(app_message(&[0; 4]), &mut buf).unwrap();
        let packet_id = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        assert_eq!(packet_id, 1);
    }

    #[test]
    fn garbage_before_frame_is_skipped() {
        let mut codec = codec(1024);
        let msg = app_message(&[0x11; 100]);

        let mut buf = BytesMut::new();
        buf.put_slice(&[0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03]);
        codec.encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(decode_all(&mut codec, &mut buf), vec![msg]);
        assert!(buf.is_empty());
    }

    #[test]
    fn garbage_without_magic_keeps_waiting() {
        let mut codec = codec(1024);
        let mut buf = BytesMut::new();
        buf.put_slice(&[0u8; 64]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // Nearly everything was discarded; only a potential magic prefix
        // survives.
        assert!(buf.len() <= 3 + FRAME_HEADER_SIZE);
    }

    #[test]
    fn bad_version_triggers_resync() {
        let mut codec = codec(1024);
        let msg = app_message(b"good");

        let mut buf = BytesMut::new();
        // A frame with the right magic but a version from the future.
        buf.put_u32(FRAME_MAGIC);
        buf.put_u16(0x7777);
        buf.put_slice(&[0u8; 14]);
        codec.encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(decode_all(&mut codec, &mut buf), vec![msg]);
    }

    #[test]
    fn oversized_chunked_packet_is_rejected() {
        let mut codec = FrameCodec::new(4, 16, false);
        let mut buf = BytesMut::new();
        // Chunk claiming to belong to a 1 MiB packet.
        buf.put_u32(FRAME_MAGIC);
        buf.put_u16(FRAME_VERSION);
        buf.put_u8(COMPRESS_NONE);
        buf.put_u8(0x33);
        buf.put_u32(1);
        buf.put_u32(1024 * 1024);
        buf.put_u32(4);
        buf.put_slice(&[0u8; 4]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(NetError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn inflight_overflow_clears_aggregates() {
        let mut codec = codec(4);
        let mut buf = BytesMut::new();
        // Open more chunked packets than the inflight ceiling, never
        // finishing any of them.
        for id in 0..(MAX_INFLIGHT_PACKETS as u32 + 1) {
            buf.put_u32(FRAME_MAGIC);
            buf.put_u16(FRAME_VERSION);
            buf.put_u8(COMPRESS_NONE);
            buf.put_u8(0x33);
            buf.put_u32(id);
            buf.put_u32(8);
            buf.put_u32(4);
            buf.put_slice(&[id as u8; 4]);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.pending_len(), 0);
    }

    #[test]
    fn interleaved_chunked_packets_reassemble() {
        let mut codec = codec(4);
        let a = app_message(&[0xaa; 8]);
        let b = app_message(&[0xbb; 8]);

        let mut framed_a = BytesMut::new();
        codec.encode(a.clone(), &mut framed_a).unwrap();
        let mut framed_b = BytesMut::new();
        codec.encode(b.clone(), &mut framed_b).unwrap();

        // Interleave: a0, b0, a1, b1.
        let frame_len = FRAME_HEADER_SIZE + 4;
        let mut buf = BytesMut::new();
        buf.put_slice(&framed_a[..frame_len]);
        buf.put_slice(&framed_b[..frame_len]);
        buf.put_slice(&framed_a[frame_len..]);
        buf.put_slice(&framed_b[frame_len..]);

        assert_eq!(decode_all(&mut codec, &mut buf), vec![a, b]);
    }
}
