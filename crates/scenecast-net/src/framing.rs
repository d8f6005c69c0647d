//! Incremental packet framing for byte streams.
//!
//! [`PacketStream`] accepts arbitrary slices of transport bytes and yields
//! every complete packet they finish. Corrupt data is never fatal: the stream
//! scans forward for the next [`PACKET_MARKER`], counting skipped bytes, and a
//! packet whose CRC does not match is reported as
//! [`FrameEvent::ChecksumFailure`] and dropped.

use std::collections::VecDeque;
use std::io::Read;

use crate::crc::crc16;
use crate::packet::{PACKET_MARKER, PacketBuffer, PacketHeader};

const MARKER_BYTES: [u8; 4] = PACKET_MARKER.to_be_bytes();

/// Result of feeding bytes into a [`PacketStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete packet that passed CRC validation.
    Packet(PacketBuffer),
    /// A complete packet whose CRC did not match. Its bytes were discarded.
    ChecksumFailure {
        /// Header of the dropped packet.
        header: PacketHeader,
        /// Bytes dropped with it, header and CRC included.
        dropped: usize,
    },
}

/// What the stream is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No buffered bytes.
    Empty,
    /// Looking for a marker or waiting for the rest of a header.
    Header,
    /// Header read, waiting for the rest of the payload and CRC.
    Payload,
}

/// Accumulates transport bytes into validated packets.
#[derive(Debug, Default)]
pub struct PacketStream {
    buffer: Vec<u8>,
    discarded: u64,
}

impl PacketStream {
    /// Create an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes thrown away so far while resynchronising or dropping corrupt packets.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Bytes buffered but not yet part of a complete packet.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Current position in the framing state machine.
    pub fn state(&self) -> StreamState {
        if self.buffer.is_empty() {
            return StreamState::Empty;
        }
        match PacketHeader::parse(&self.buffer) {
            Some(header) if header.is_valid() => StreamState::Payload,
            _ => StreamState::Header,
        }
    }

    /// Drop all buffered bytes without counting them as discarded.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Feed newly received bytes and collect every packet they complete.
    pub fn append(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(event) = self.extract() {
            events.push(event);
        }
        events
    }

    fn discard(&mut self, count: usize) {
        self.buffer.drain(..count);
        self.discarded += count as u64;
    }

    fn extract(&mut self) -> Option<FrameEvent> {
        loop {
            match find_marker(&self.buffer) {
                Some(0) => {}
                Some(at) => {
                    tracing::trace!(skipped = at, "resynchronising packet stream");
                    self.discard(at);
                }
                None => {
                    // Keep a possible partial marker at the tail.
                    let keep = partial_marker_len(&self.buffer);
                    let skip = self.buffer.len() - keep;
                    if skip > 0 {
                        self.discard(skip);
                    }
                    return None;
                }
            }

            let header = PacketHeader::parse(&self.buffer)?;
            if !header.is_valid() {
                tracing::debug!(
                    major = header.version_major,
                    minor = header.version_minor,
                    "unsupported packet version"
                );
                self.discard(1);
                continue;
            }

            let total = header.total_size();
            if self.buffer.len() < total {
                return None;
            }

            if header.has_crc() {
                let end = header.packet_size();
                let expected = u16::from_be_bytes([self.buffer[end], self.buffer[end + 1]]);
                if crc16(&self.buffer[..end]) != expected {
                    tracing::warn!(
                        routing_id = header.routing_id,
                        message_id = header.message_id,
                        bytes = total,
                        "packet CRC mismatch, dropping"
                    );
                    self.discard(total);
                    return Some(FrameEvent::ChecksumFailure {
                        header,
                        dropped: total,
                    });
                }
            }

            let bytes: Vec<u8> = self.buffer.drain(..total).collect();
            return Some(FrameEvent::Packet(PacketBuffer::from_validated(header, bytes)));
        }
    }
}

fn find_marker(bytes: &[u8]) -> Option<usize> {
    bytes.windows(MARKER_BYTES.len()).position(|w| w == MARKER_BYTES)
}

fn partial_marker_len(bytes: &[u8]) -> usize {
    (1..MARKER_BYTES.len())
        .rev()
        .find(|&len| bytes.len() >= len && bytes[bytes.len() - len..] == MARKER_BYTES[..len])
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// PacketReader
// ---------------------------------------------------------------------------

/// Pulls packets from a blocking [`Read`] source such as a client socket.
pub struct PacketReader<R> {
    inner: R,
    stream: PacketStream,
    pending: VecDeque<FrameEvent>,
    chunk: Box<[u8]>,
}

impl<R: Read> PacketReader<R> {
    /// Wrap `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            stream: PacketStream::new(),
            pending: VecDeque::new(),
            chunk: vec![0u8; 4 * 1024].into_boxed_slice(),
        }
    }

    /// The underlying framing state.
    pub fn stream(&self) -> &PacketStream {
        &self.stream
    }

    /// Borrow the wrapped reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Read until the next frame event. Returns `None` at end of stream.
    pub fn next_event(&mut self) -> std::io::Result<Option<FrameEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            let read = self.inner.read(&mut self.chunk)?;
            if read == 0 {
                return Ok(None);
            }
            self.pending.extend(self.stream.append(&self.chunk[..read]));
        }
    }

    /// Read until the next valid packet, skipping CRC failures.
    pub fn next_packet(&mut self) -> std::io::Result<Option<PacketBuffer>> {
        while let Some(event) = self.next_event()? {
            if let FrameEvent::Packet(packet) = event {
                return Ok(Some(packet));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FLAG_NO_CRC, HEADER_SIZE};

    fn packet_bytes(routing_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = PacketBuffer::new();
        packet.reset(routing_id, 1);
        packet.write(payload).unwrap();
        packet.finalise().unwrap();
        packet.data().unwrap().to_vec()
    }

    fn packets(events: Vec<FrameEvent>) -> Vec<PacketBuffer> {
        events
            .into_iter()
            .filter_map(|e| match e {
                FrameEvent::Packet(p) => Some(p),
                FrameEvent::ChecksumFailure { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_single_packet() {
        let bytes = packet_bytes(64, &[1, 2, 3]);
        let mut stream = PacketStream::new();
        let out = packets(stream.append(&bytes));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data().unwrap(), bytes.as_slice());
        assert_eq!(stream.discarded_bytes(), 0);
        assert_eq!(stream.state(), StreamState::Empty);
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = packet_bytes(64, &[9; 40]);
        let mut stream = PacketStream::new();
        let mut out = Vec::new();
        for (i, b) in bytes.iter().enumerate() {
            let events = stream.append(std::slice::from_ref(b));
            if i + 1 < bytes.len() {
                assert!(events.is_empty());
            }
            out.extend(packets(events));
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload(), &[9; 40]);
        assert_eq!(stream.discarded_bytes(), 0);
    }

    #[test]
    fn test_state_progression() {
        let bytes = packet_bytes(64, &[1; 8]);
        let mut stream = PacketStream::new();
        assert_eq!(stream.state(), StreamState::Empty);
        stream.append(&bytes[..6]);
        assert_eq!(stream.state(), StreamState::Header);
        stream.append(&bytes[6..HEADER_SIZE + 2]);
        assert_eq!(stream.state(), StreamState::Payload);
        let out = stream.append(&bytes[HEADER_SIZE + 2..]);
        assert_eq!(out.len(), 1);
        assert_eq!(stream.state(), StreamState::Empty);
    }

    #[test]
    fn test_multiple_packets_in_one_append() {
        let mut bytes = packet_bytes(64, &[1]);
        bytes.extend(packet_bytes(65, &[2, 2]));
        bytes.extend(packet_bytes(66, &[]));
        let mut stream = PacketStream::new();
        let out = packets(stream.append(&bytes));
        let routing: Vec<u16> = out.iter().map(|p| p.header().routing_id).collect();
        assert_eq!(routing, vec![64, 65, 66]);
    }

    #[test]
    fn test_leading_garbage_is_discarded() {
        let mut bytes = vec![0xAA, 0xBB, 0xCC, 0x03, 0xE5];
        bytes.extend(packet_bytes(64, &[7]));
        let mut stream = PacketStream::new();
        let out = packets(stream.append(&bytes));
        assert_eq!(out.len(), 1);
        assert_eq!(stream.discarded_bytes(), 5);
    }

    #[test]
    fn test_partial_marker_kept_across_appends() {
        let bytes = packet_bytes(64, &[7]);
        let mut stream = PacketStream::new();
        assert!(stream.append(&[0x11, bytes[0], bytes[1]]).is_empty());
        assert_eq!(stream.discarded_bytes(), 1);
        assert_eq!(stream.pending_bytes(), 2);
        let out = packets(stream.append(&bytes[2..]));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_checksum_failure_then_recovery() {
        let mut bad = packet_bytes(64, &[1, 2, 3, 4]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let good = packet_bytes(65, &[5, 6]);

        let mut stream = PacketStream::new();
        let mut input = bad.clone();
        input.extend_from_slice(&good);
        let events = stream.append(&input);

        assert_eq!(events.len(), 2);
        match &events[0] {
            FrameEvent::ChecksumFailure { header, dropped } => {
                assert_eq!(header.routing_id, 64);
                assert_eq!(*dropped, bad.len());
            }
            other => panic!("expected checksum failure, got {other:?}"),
        }
        match &events[1] {
            FrameEvent::Packet(p) => assert_eq!(p.data().unwrap(), good.as_slice()),
            other => panic!("expected packet, got {other:?}"),
        }
        assert_eq!(stream.discarded_bytes(), bad.len() as u64);
    }

    #[test]
    fn test_no_crc_packet_accepted() {
        let mut packet = PacketBuffer::new();
        packet.reset(64, 2);
        packet.write(&[1, 2]).unwrap();
        packet.finalise_without_crc().unwrap();
        let mut stream = PacketStream::new();
        let out = packets(stream.append(packet.data().unwrap()));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].header().flags & FLAG_NO_CRC, FLAG_NO_CRC);
    }

    #[test]
    fn test_bad_version_resynchronises() {
        let mut stale = packet_bytes(64, &[1]);
        stale[7] = 9;
        let good = packet_bytes(65, &[2]);
        let mut input = stale.clone();
        input.extend_from_slice(&good);

        let mut stream = PacketStream::new();
        let out = packets(stream.append(&input));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].header().routing_id, 65);
        assert_eq!(stream.discarded_bytes(), stale.len() as u64);
    }

    #[test]
    fn test_reader_over_cursor() {
        let mut bytes = packet_bytes(64, &[1]);
        bytes.extend(packet_bytes(65, &[2]));
        let mut reader = PacketReader::new(std::io::Cursor::new(bytes));
        assert_eq!(reader.next_packet().unwrap().unwrap().header().routing_id, 64);
        assert_eq!(reader.next_packet().unwrap().unwrap().header().routing_id, 65);
        assert!(reader.next_packet().unwrap().is_none());
    }
}
