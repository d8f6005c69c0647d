//! Packet header and packet buffer.
//!
//! Every packet on the wire is a fixed 16 byte header, a payload and, unless
//! the header carries [`FLAG_NO_CRC`], a 16-bit CRC over header and payload:
//!
//! ```text
//! +--------+-------+-------+---------+---------+--------+--------+-------+---------+-------+
//! | marker | major | minor | routing | message | size   | offset | flags | payload | crc   |
//! | u32    | u16   | u16   | u16     | u16     | u16    | u8     | u8    | size    | u16   |
//! +--------+-------+-------+---------+---------+--------+--------+-------+---------+-------+
//! ```
//!
//! All fields are big-endian (network byte order).

use crate::crc::{CRC_SIZE, crc16};

/// Four byte sequence identifying the start of a packet.
pub const PACKET_MARKER: u32 = 0x03E5_5E30;
/// Current protocol major version.
pub const VERSION_MAJOR: u16 = 0;
/// Current protocol minor version.
pub const VERSION_MINOR: u16 = 1;
/// Byte size of [`PacketHeader`] on the wire.
pub const HEADER_SIZE: usize = 16;
/// Byte offset of the payload size field within the header.
pub const PAYLOAD_SIZE_OFFSET: usize = 12;
/// Byte offset of the flags field within the header.
pub const FLAGS_OFFSET: usize = 15;
/// Header flag: the packet has no CRC trailer.
pub const FLAG_NO_CRC: u8 = 1 << 0;
/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Errors raised by packet construction and payload decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// Write or finalise attempted before `reset` started a packet.
    #[error("packet has not been started")]
    NotStarted,
    /// The packet was already finalised.
    #[error("packet already finalised")]
    AlreadyFinalised,
    /// Bytes were requested from a packet that has not been finalised.
    #[error("packet not finalised")]
    NotFinalised,
    /// The payload does not fit in the 16-bit size field.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Largest allowed payload size.
        max: usize,
    },
    /// A payload read ran past the end of the payload.
    #[error("payload truncated: needed {needed} bytes, {available} available")]
    Truncated {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the payload.
        available: usize,
    },
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Start marker, [`PACKET_MARKER`] for valid packets.
    pub marker: u32,
    /// Protocol major version.
    pub version_major: u16,
    /// Protocol minor version.
    pub version_minor: u16,
    /// Message family.
    pub routing_id: u16,
    /// Message within the family.
    pub message_id: u16,
    /// Payload byte count, excluding header and CRC.
    pub payload_size: u16,
    /// Extra header bytes between this header and the payload.
    pub payload_offset: u8,
    /// Packet flags, see [`FLAG_NO_CRC`].
    pub flags: u8,
}

impl PacketHeader {
    /// A header for the current protocol version with an empty payload.
    pub fn new(routing_id: u16, message_id: u16) -> Self {
        Self {
            marker: PACKET_MARKER,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            routing_id,
            message_id,
            payload_size: 0,
            payload_offset: 0,
            flags: 0,
        }
    }

    /// Decode a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    ///
    /// Returns `None` if there are not enough bytes. The result is not
    /// validated; see [`PacketHeader::is_valid`].
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let u16_at = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);
        Some(Self {
            marker: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            version_major: u16_at(4),
            version_minor: u16_at(6),
            routing_id: u16_at(8),
            message_id: u16_at(10),
            payload_size: u16_at(PAYLOAD_SIZE_OFFSET),
            payload_offset: bytes[14],
            flags: bytes[FLAGS_OFFSET],
        })
    }

    /// Encode the header in network byte order.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.marker.to_be_bytes());
        out[4..6].copy_from_slice(&self.version_major.to_be_bytes());
        out[6..8].copy_from_slice(&self.version_minor.to_be_bytes());
        out[8..10].copy_from_slice(&self.routing_id.to_be_bytes());
        out[10..12].copy_from_slice(&self.message_id.to_be_bytes());
        out[12..14].copy_from_slice(&self.payload_size.to_be_bytes());
        out[14] = self.payload_offset;
        out[FLAGS_OFFSET] = self.flags;
        out
    }

    /// True when marker and version match this implementation.
    pub fn is_valid(&self) -> bool {
        self.marker == PACKET_MARKER
            && self.version_major == VERSION_MAJOR
            && self.version_minor == VERSION_MINOR
    }

    /// True unless the packet is flagged as having no CRC.
    pub fn has_crc(&self) -> bool {
        self.flags & FLAG_NO_CRC == 0
    }

    /// Bytes following the header, excluding the CRC.
    pub fn data_size(&self) -> usize {
        self.payload_offset as usize + self.payload_size as usize
    }

    /// Header plus data bytes, excluding the CRC.
    pub fn packet_size(&self) -> usize {
        HEADER_SIZE + self.data_size()
    }

    /// Full on-wire size including the CRC trailer when present.
    pub fn total_size(&self) -> usize {
        self.packet_size() + if self.has_crc() { CRC_SIZE } else { 0 }
    }
}

/// Lifecycle of a [`PacketBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Nothing written.
    Empty,
    /// Header written, payload being appended.
    Collating,
    /// Finalised; size fields fixed and CRC appended.
    Complete,
}

/// A single packet, either under construction or complete.
///
/// Outgoing packets follow `reset` → `write*` → `finalise` → `data`. Incoming
/// packets are produced complete by [`crate::framing::PacketStream`] or
/// re-framed with [`PacketBuffer::from_parts`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketBuffer {
    header: PacketHeader,
    bytes: Vec<u8>,
    status: PacketStatus,
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create an empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            header: PacketHeader::new(0, 0),
            bytes: Vec::with_capacity(capacity),
            status: PacketStatus::Empty,
        }
    }

    /// Re-frame a packet from an already validated header and payload.
    ///
    /// The header is trusted as given. `crc` is appended verbatim when the
    /// header expects one; if it is `None` a fresh CRC is computed instead.
    pub fn from_parts(header: PacketHeader, payload: &[u8], crc: Option<u16>) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(payload);
        if header.has_crc() {
            let crc = crc.unwrap_or_else(|| crc16(&bytes));
            bytes.extend_from_slice(&crc.to_be_bytes());
        }
        Self {
            header,
            bytes,
            status: PacketStatus::Complete,
        }
    }

    /// Wrap bytes the stream reader has already framed and validated.
    pub(crate) fn from_validated(header: PacketHeader, bytes: Vec<u8>) -> Self {
        Self {
            header,
            bytes,
            status: PacketStatus::Complete,
        }
    }

    /// Clear any pending content and start a new packet.
    pub fn reset(&mut self, routing_id: u16, message_id: u16) {
        self.header = PacketHeader::new(routing_id, message_id);
        self.bytes.clear();
        self.bytes.extend_from_slice(&self.header.to_bytes());
        self.status = PacketStatus::Collating;
    }

    /// Drop all content, returning to [`PacketStatus::Empty`].
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.header = PacketHeader::new(0, 0);
        self.status = PacketStatus::Empty;
    }

    /// Current lifecycle state.
    pub fn status(&self) -> PacketStatus {
        self.status
    }

    /// True once `reset` has been called and until `clear`.
    pub fn is_started(&self) -> bool {
        self.status != PacketStatus::Empty
    }

    /// True once finalised.
    pub fn is_complete(&self) -> bool {
        self.status == PacketStatus::Complete
    }

    /// The packet header. Size fields are only meaningful once complete.
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    /// Append raw payload bytes.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        match self.status {
            PacketStatus::Empty => Err(PacketError::NotStarted),
            PacketStatus::Complete => Err(PacketError::AlreadyFinalised),
            PacketStatus::Collating => {
                self.bytes.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    /// Append a byte.
    pub fn write_u8(&mut self, value: u8) -> Result<(), PacketError> {
        self.write(&[value])
    }

    /// Append a big-endian `u16`.
    pub fn write_u16(&mut self, value: u16) -> Result<(), PacketError> {
        self.write(&value.to_be_bytes())
    }

    /// Append a big-endian `u32`.
    pub fn write_u32(&mut self, value: u32) -> Result<(), PacketError> {
        self.write(&value.to_be_bytes())
    }

    /// Append a big-endian `u64`.
    pub fn write_u64(&mut self, value: u64) -> Result<(), PacketError> {
        self.write(&value.to_be_bytes())
    }

    /// Append a big-endian `f32`.
    pub fn write_f32(&mut self, value: f32) -> Result<(), PacketError> {
        self.write(&value.to_be_bytes())
    }

    /// Append a big-endian `f64`.
    pub fn write_f64(&mut self, value: f64) -> Result<(), PacketError> {
        self.write(&value.to_be_bytes())
    }

    /// Payload bytes written so far.
    pub fn payload_len(&self) -> usize {
        self.bytes.len().saturating_sub(HEADER_SIZE)
    }

    /// Fix the payload size and append the CRC.
    pub fn finalise(&mut self) -> Result<(), PacketError> {
        self.finalise_with(true)
    }

    /// Fix the payload size and flag the packet as carrying no CRC.
    pub fn finalise_without_crc(&mut self) -> Result<(), PacketError> {
        self.finalise_with(false)
    }

    fn finalise_with(&mut self, add_crc: bool) -> Result<(), PacketError> {
        match self.status {
            PacketStatus::Empty => return Err(PacketError::NotStarted),
            PacketStatus::Complete => return Err(PacketError::AlreadyFinalised),
            PacketStatus::Collating => {}
        }

        let payload_size = self.payload_len();
        let Ok(size) = u16::try_from(payload_size) else {
            return Err(PacketError::PayloadTooLarge {
                size: payload_size,
                max: MAX_PAYLOAD_SIZE,
            });
        };
        self.header.payload_size = size;
        self.bytes[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 2].copy_from_slice(&size.to_be_bytes());

        if add_crc {
            let crc = crc16(&self.bytes);
            self.bytes.extend_from_slice(&crc.to_be_bytes());
        } else {
            self.header.flags |= FLAG_NO_CRC;
            self.bytes[FLAGS_OFFSET] = self.header.flags;
        }
        self.status = PacketStatus::Complete;
        Ok(())
    }

    /// Finalised packet bytes, ready for transmission.
    pub fn data(&self) -> Result<&[u8], PacketError> {
        if self.status != PacketStatus::Complete {
            return Err(PacketError::NotFinalised);
        }
        Ok(&self.bytes)
    }

    /// Byte count currently held, including header and CRC.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The payload region.
    pub fn payload(&self) -> &[u8] {
        let start = (HEADER_SIZE + self.header.payload_offset as usize).min(self.bytes.len());
        let end = match self.status {
            PacketStatus::Complete => (start + self.header.payload_size as usize).min(self.bytes.len()),
            _ => self.bytes.len(),
        };
        &self.bytes[start..end]
    }

    /// A reader over the payload region.
    pub fn reader(&self) -> PayloadReader<'_> {
        PayloadReader::new(self.payload())
    }

    /// The CRC trailer, if the packet is complete and carries one.
    pub fn crc(&self) -> Option<u16> {
        if self.status != PacketStatus::Complete || !self.header.has_crc() {
            return None;
        }
        let end = self.header.packet_size();
        let bytes = self.bytes.get(end..end + CRC_SIZE)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Recompute the CRC and compare it with the trailer.
    ///
    /// Packets without a CRC always pass.
    pub fn crc_ok(&self) -> bool {
        if !self.header.has_crc() {
            return true;
        }
        match self.crc() {
            Some(crc) => crc16(&self.bytes[..self.header.packet_size()]) == crc,
            None => false,
        }
    }
}

/// Bounds-checked big-endian reader over a payload.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Start reading at the beginning of `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Consume exactly `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], PacketError> {
        if self.remaining() < len {
            return Err(PacketError::Truncated {
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Read a byte.
    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Read a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, PacketError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    /// Read a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, PacketError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    /// Read a big-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64, PacketError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    /// Read a big-endian `f32`.
    pub fn read_f32(&mut self) -> Result<f32, PacketError> {
        Ok(f32::from_be_bytes(self.read_array()?))
    }

    /// Read a big-endian `f64`.
    pub fn read_f64(&mut self) -> Result<f64, PacketError> {
        Ok(f64::from_be_bytes(self.read_array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalised(routing_id: u16, message_id: u16, payload: &[u8]) -> PacketBuffer {
        let mut packet = PacketBuffer::new();
        packet.reset(routing_id, message_id);
        packet.write(payload).unwrap();
        packet.finalise().unwrap();
        packet
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let mut header = PacketHeader::new(0x0102, 0x0304);
        header.payload_size = 0x0506;
        header.flags = FLAG_NO_CRC;
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0x03, 0xE5, 0x5E, 0x30]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 1]);
        assert_eq!(&bytes[8..10], &[0x01, 0x02]);
        assert_eq!(&bytes[10..12], &[0x03, 0x04]);
        assert_eq!(&bytes[12..14], &[0x05, 0x06]);
        assert_eq!(bytes[14], 0);
        assert_eq!(bytes[15], FLAG_NO_CRC);
        assert_eq!(PacketHeader::parse(&bytes), Some(header));
    }

    #[test]
    fn test_parse_short_input() {
        assert!(PacketHeader::parse(&[0u8; HEADER_SIZE - 1]).is_none());
    }

    #[test]
    fn test_invalid_marker_detected() {
        let mut header = PacketHeader::new(1, 0);
        header.marker = 0xDEAD_BEEF;
        assert!(!header.is_valid());
        header.marker = PACKET_MARKER;
        header.version_minor = 7;
        assert!(!header.is_valid());
    }

    #[test]
    fn test_finalise_sets_size_and_crc() {
        let packet = finalised(2, 1, &[1, 2, 3, 4]);
        let data = packet.data().unwrap();
        assert_eq!(data.len(), HEADER_SIZE + 4 + CRC_SIZE);
        assert_eq!(&data[12..14], &[0, 4]);
        assert_eq!(packet.header().payload_size, 4);
        assert_eq!(packet.payload(), &[1, 2, 3, 4]);
        let expected = crc16(&data[..HEADER_SIZE + 4]);
        assert_eq!(packet.crc(), Some(expected));
        assert!(packet.crc_ok());
    }

    #[test]
    fn test_finalise_without_crc_sets_flag() {
        let mut packet = PacketBuffer::new();
        packet.reset(2, 1);
        packet.write_u32(7).unwrap();
        packet.finalise_without_crc().unwrap();
        let data = packet.data().unwrap();
        assert_eq!(data.len(), HEADER_SIZE + 4);
        assert_eq!(data[FLAGS_OFFSET] & FLAG_NO_CRC, FLAG_NO_CRC);
        assert!(!packet.header().has_crc());
        assert_eq!(packet.crc(), None);
    }

    #[test]
    fn test_double_finalise_is_an_error() {
        let mut packet = finalised(2, 1, &[]);
        assert_eq!(packet.finalise(), Err(PacketError::AlreadyFinalised));
    }

    #[test]
    fn test_data_before_finalise_is_an_error() {
        let mut packet = PacketBuffer::new();
        assert_eq!(packet.data(), Err(PacketError::NotFinalised));
        packet.reset(1, 1);
        assert_eq!(packet.data(), Err(PacketError::NotFinalised));
    }

    #[test]
    fn test_write_requires_reset() {
        let mut packet = PacketBuffer::new();
        assert_eq!(packet.write_u8(1), Err(PacketError::NotStarted));
        assert_eq!(packet.finalise(), Err(PacketError::NotStarted));
    }

    #[test]
    fn test_write_after_finalise_is_an_error() {
        let mut packet = finalised(1, 1, &[]);
        assert_eq!(packet.write_u8(1), Err(PacketError::AlreadyFinalised));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut packet = PacketBuffer::new();
        packet.reset(1, 1);
        packet.write(&vec![0u8; MAX_PAYLOAD_SIZE + 1]).unwrap();
        assert!(matches!(
            packet.finalise(),
            Err(PacketError::PayloadTooLarge { .. })
        ));
        assert!(!packet.is_complete());
    }

    #[test]
    fn test_reset_reuses_buffer() {
        let mut packet = finalised(5, 6, &[9; 32]);
        packet.reset(7, 8);
        assert_eq!(packet.status(), PacketStatus::Collating);
        assert_eq!(packet.len(), HEADER_SIZE);
        assert_eq!(packet.header().routing_id, 7);
        assert_eq!(packet.header().message_id, 8);
    }

    #[test]
    fn test_from_parts_preserves_supplied_crc() {
        let original = finalised(64, 1, &[10, 20, 30]);
        let rebuilt =
            PacketBuffer::from_parts(*original.header(), original.payload(), original.crc());
        assert_eq!(rebuilt.data().unwrap(), original.data().unwrap());
    }

    #[test]
    fn test_from_parts_trusts_header() {
        let original = finalised(64, 1, &[10, 20, 30]);
        // A bogus CRC is carried through untouched; validation is the outer
        // packet's responsibility.
        let rebuilt = PacketBuffer::from_parts(*original.header(), original.payload(), Some(0));
        assert_eq!(rebuilt.crc(), Some(0));
        assert!(!rebuilt.crc_ok());
    }

    #[test]
    fn test_payload_reader_reads_fields() {
        let mut packet = PacketBuffer::new();
        packet.reset(1, 1);
        packet.write_u8(0xAB).unwrap();
        packet.write_u16(0x1234).unwrap();
        packet.write_u32(0xDEAD_BEEF).unwrap();
        packet.write_u64(42).unwrap();
        packet.write_f32(1.5).unwrap();
        packet.write_f64(-2.25).unwrap();
        packet.finalise().unwrap();

        let mut reader = packet.reader();
        assert_eq!(reader.read_u8().unwrap(), 0xAB);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_u64().unwrap(), 42);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert_eq!(reader.read_f64().unwrap(), -2.25);
        assert_eq!(reader.remaining(), 0);
        assert_eq!(
            reader.read_u8(),
            Err(PacketError::Truncated {
                needed: 1,
                available: 0
            })
        );
    }
}
