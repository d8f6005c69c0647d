//! Collation codec: many framed packets packed into one outer packet.
//!
//! The outer packet uses [`routing::COLLATED_PACKET`] and carries a
//! [`CollatedPacketMessage`] followed by the inner packets, verbatim or as a
//! single gzip stream:
//!
//! ```text
//! +--------------+-----------------------+------------------------------+-----+
//! | header (16)  | collated message (8)  | inner packets (maybe gzip)   | crc |
//! +--------------+-----------------------+------------------------------+-----+
//! ```
//!
//! The outer payload size and the uncompressed byte total are not known until
//! the encoder is finalised, so placeholders are written first and patched in
//! place afterwards.

use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::connection::{Connection, ConnectionError, encode_create, lock};
use crate::crc::{CRC_SIZE, crc16};
use crate::messages::{
    COLLATED_COMPRESSED, CollatedPacketMessage, ServerInfoMessage, WireMessage, routing,
};
use crate::packet::{HEADER_SIZE, PAYLOAD_SIZE_OFFSET, PacketBuffer, PacketError, PacketHeader};
use crate::shape::{Resource, Shape};

/// Largest collated packet, header and CRC included.
pub const MAX_PACKET_SIZE: usize = 0xFFFF;
/// Fixed bytes around the collated payload: header, message and CRC.
pub const OVERHEAD: usize = HEADER_SIZE + CollatedPacketMessage::SIZE + CRC_SIZE;
/// Headroom reserved for gzip framing and incompressible input.
pub const COMPRESSION_MARGIN: usize = 64;

/// Offset of the first inner packet within a collated packet.
pub const COLLATED_REGION_OFFSET: usize = HEADER_SIZE + CollatedPacketMessage::SIZE;

const UNCOMPRESSED_OFFSET: usize = HEADER_SIZE + 4;

/// Errors raised by the collation codec.
#[derive(Debug, thiserror::Error)]
pub enum CollationError {
    /// Adding the bytes would overflow the outer packet. Flush and retry.
    #[error("collated packet full: {collated} bytes collated, {requested} more requested")]
    Full {
        /// Bytes already collated.
        collated: usize,
        /// Bytes the rejected add carried.
        requested: usize,
    },
    /// The encoder has been finalised and must be reset before reuse.
    #[error("collated packet already finalised")]
    Finalised,
    /// The bytes could never fit, even in an empty collated packet.
    #[error("{size} bytes exceed collated packet capacity")]
    PacketTooLarge {
        /// Size of the rejected bytes or finished packet.
        size: usize,
    },
    /// An inner or outer packet violated its lifecycle.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    /// Compression or decompression failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The collated payload ended in the middle of an inner packet.
    #[error("collated payload truncated")]
    Truncated,
    /// An inner packet header had a bad marker or version.
    #[error("invalid inner packet header")]
    InvalidPacket,
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Packs finalised packets into a single collated packet.
pub struct CollatedPacketEncoder {
    buffer: Vec<u8>,
    gzip: Option<GzEncoder<Vec<u8>>>,
    compress: bool,
    collated_bytes: usize,
    finalised: bool,
}

impl std::fmt::Debug for CollatedPacketEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollatedPacketEncoder")
            .field("compress", &self.compress)
            .field("collated_bytes", &self.collated_bytes)
            .field("finalised", &self.finalised)
            .finish()
    }
}

impl CollatedPacketEncoder {
    /// Create an encoder ready to accept packets.
    pub fn new(compress: bool) -> Self {
        let mut encoder = Self {
            buffer: Vec::with_capacity(MAX_PACKET_SIZE),
            gzip: None,
            compress,
            collated_bytes: 0,
            finalised: false,
        };
        encoder.reset();
        encoder
    }

    /// True when inner packets are gzip-compressed.
    pub fn compression_enabled(&self) -> bool {
        self.compress
    }

    /// Discard any collated data and start a new outer packet.
    pub fn reset(&mut self) {
        let mut buffer = match self.gzip.take() {
            Some(gzip) => gzip.finish().unwrap_or_default(),
            None => std::mem::take(&mut self.buffer),
        };
        buffer.clear();
        buffer.extend_from_slice(&PacketHeader::new(routing::COLLATED_PACKET, 0).to_bytes());
        let message = CollatedPacketMessage {
            flags: if self.compress { COLLATED_COMPRESSED } else { 0 },
            reserved: 0,
            uncompressed_bytes: 0,
        };
        buffer.extend_from_slice(&message.to_bytes());

        if self.compress {
            self.gzip = Some(GzEncoder::new(buffer, Compression::default()));
        } else {
            self.buffer = buffer;
        }
        self.collated_bytes = 0;
        self.finalised = false;
    }

    /// Uncompressed bytes added since the last reset.
    pub fn collated_bytes(&self) -> usize {
        self.collated_bytes
    }

    /// True once [`CollatedPacketEncoder::finalise`] has succeeded.
    pub fn is_finalised(&self) -> bool {
        self.finalised
    }

    fn reserve(&self) -> usize {
        OVERHEAD + if self.compress { COMPRESSION_MARGIN } else { 0 }
    }

    /// Append one finalised packet.
    pub fn add_packet(&mut self, packet: &PacketBuffer) -> Result<(), CollationError> {
        self.add(packet.data()?)
    }

    /// Append the bytes of one or more finalised packets.
    ///
    /// Fails with [`CollationError::Full`] without writing anything when the
    /// outer packet lacks room.
    pub fn add(&mut self, bytes: &[u8]) -> Result<(), CollationError> {
        if self.finalised {
            return Err(CollationError::Finalised);
        }
        if bytes.len() + self.reserve() > MAX_PACKET_SIZE {
            return Err(CollationError::PacketTooLarge { size: bytes.len() });
        }
        if self.collated_bytes + bytes.len() + self.reserve() > MAX_PACKET_SIZE {
            return Err(CollationError::Full {
                collated: self.collated_bytes,
                requested: bytes.len(),
            });
        }

        match self.gzip.as_mut() {
            Some(gzip) => gzip.write_all(bytes)?,
            None => self.buffer.extend_from_slice(bytes),
        }
        self.collated_bytes += bytes.len();
        Ok(())
    }

    /// Close the compressor, patch the size fields and append the CRC.
    pub fn finalise(&mut self) -> Result<(), CollationError> {
        if self.finalised {
            return Err(CollationError::Finalised);
        }
        if let Some(gzip) = self.gzip.take() {
            self.buffer = gzip.finish()?;
        }

        let payload_size = self.buffer.len() - HEADER_SIZE;
        if self.buffer.len() + CRC_SIZE > MAX_PACKET_SIZE {
            let size = self.buffer.len() + CRC_SIZE;
            self.reset();
            return Err(CollationError::PacketTooLarge { size });
        }
        let payload_size = payload_size as u16;
        self.buffer[PAYLOAD_SIZE_OFFSET..PAYLOAD_SIZE_OFFSET + 2]
            .copy_from_slice(&payload_size.to_be_bytes());
        self.buffer[UNCOMPRESSED_OFFSET..UNCOMPRESSED_OFFSET + 4]
            .copy_from_slice(&(self.collated_bytes as u32).to_be_bytes());

        let crc = crc16(&self.buffer);
        self.buffer.extend_from_slice(&crc.to_be_bytes());
        self.finalised = true;
        Ok(())
    }

    /// The finished outer packet.
    pub fn data(&self) -> Result<&[u8], CollationError> {
        if !self.finalised {
            return Err(PacketError::NotFinalised.into());
        }
        Ok(&self.buffer)
    }

    /// Bytes in the outer buffer; only meaningful once finalised when compressing.
    pub fn len(&self) -> usize {
        match &self.gzip {
            Some(gzip) => gzip.get_ref().len(),
            None => self.buffer.len(),
        }
    }

    /// True when no inner packets have been added.
    pub fn is_empty(&self) -> bool {
        self.collated_bytes == 0
    }

    /// The inner packets as added. `None` when compressing.
    pub fn collated_region(&self) -> Option<&[u8]> {
        if self.compress {
            return None;
        }
        self.buffer
            .get(COLLATED_REGION_OFFSET..COLLATED_REGION_OFFSET + self.collated_bytes)
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

enum Source {
    Idle,
    PassThrough(PacketBuffer),
    Stream(Box<dyn Read + Send>),
}

/// Splits a collated packet back into its inner packets.
///
/// Packets with any other routing id pass through unchanged.
pub struct CollatedPacketDecoder {
    source: Source,
    decoded_bytes: usize,
    target_bytes: usize,
}

impl Default for CollatedPacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CollatedPacketDecoder {
    /// Create an idle decoder.
    pub fn new() -> Self {
        Self {
            source: Source::Idle,
            decoded_bytes: 0,
            target_bytes: 0,
        }
    }

    /// True while packets remain to be returned.
    pub fn is_decoding(&self) -> bool {
        !matches!(self.source, Source::Idle)
    }

    /// Inner bytes decoded from the current collated packet.
    pub fn decoded_bytes(&self) -> usize {
        self.decoded_bytes
    }

    /// Start decoding `packet`.
    pub fn set_packet(&mut self, packet: PacketBuffer) -> Result<(), CollationError> {
        self.decoded_bytes = 0;
        self.target_bytes = 0;
        if packet.header().routing_id != routing::COLLATED_PACKET {
            self.source = Source::PassThrough(packet);
            return Ok(());
        }

        self.source = Source::Idle;
        let message = CollatedPacketMessage::read(&mut packet.reader())?;
        let body = packet.payload()[CollatedPacketMessage::SIZE..].to_vec();
        let cursor = Cursor::new(body);
        self.target_bytes = message.uncompressed_bytes as usize;
        self.source = if message.is_compressed() {
            Source::Stream(Box::new(GzDecoder::new(cursor)))
        } else {
            Source::Stream(Box::new(cursor))
        };
        Ok(())
    }

    /// Next inner packet, or `None` once exhausted.
    ///
    /// A read failure is reported once; the decoder is exhausted afterwards.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<PacketBuffer>, CollationError> {
        match std::mem::replace(&mut self.source, Source::Idle) {
            Source::Idle => Ok(None),
            Source::PassThrough(packet) => Ok(Some(packet)),
            Source::Stream(mut stream) => {
                if self.decoded_bytes >= self.target_bytes {
                    return Ok(None);
                }
                let packet = read_inner(&mut stream)?;
                self.decoded_bytes += packet.len();
                self.source = Source::Stream(stream);
                Ok(Some(packet))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CollatingConnection
// ---------------------------------------------------------------------------

struct CollatingState {
    encoder: CollatedPacketEncoder,
    packet: PacketBuffer,
}

/// A [`Connection`] that only collates.
///
/// Shape messages are appended to an internal [`CollatedPacketEncoder`]
/// which the owner finalises and ships, for instance to record a block of
/// messages or to pre-build one and send it to several clients. Operations
/// that need a live client return [`ConnectionError::Unsupported`].
pub struct CollatingConnection {
    state: Mutex<CollatingState>,
    active: AtomicBool,
}

impl CollatingConnection {
    /// Create an empty collation, gzip-compressed when `compress` is set.
    pub fn new(compress: bool) -> Self {
        Self {
            state: Mutex::new(CollatingState {
                encoder: CollatedPacketEncoder::new(compress),
                packet: PacketBuffer::new(),
            }),
            active: AtomicBool::new(true),
        }
    }

    /// Uncompressed bytes collated so far.
    pub fn collated_bytes(&self) -> usize {
        lock(&self.state).encoder.collated_bytes()
    }

    /// Run `f` with the encoder.
    pub fn with_encoder<R>(&self, f: impl FnOnce(&mut CollatedPacketEncoder) -> R) -> R {
        f(&mut lock(&self.state).encoder)
    }

    /// Finalise, copy out the finished packet and reset for more messages.
    pub fn take_packet(&self) -> Result<Vec<u8>, CollationError> {
        let mut state = lock(&self.state);
        state.encoder.finalise()?;
        let bytes = state.encoder.data()?.to_vec();
        state.encoder.reset();
        Ok(bytes)
    }

    fn append(
        &self,
        write: impl FnOnce(&mut PacketBuffer) -> Result<(), PacketError>,
    ) -> Result<usize, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        let mut guard = lock(&self.state);
        let CollatingState { encoder, packet } = &mut *guard;
        write(packet)?;
        packet.finalise()?;
        let bytes = packet.data()?;
        encoder.add(bytes)?;
        Ok(bytes.len())
    }
}

impl Connection for CollatingConnection {
    fn address(&self) -> String {
        "collation".to_string()
    }

    fn port(&self) -> u16 {
        0
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn close(&self) {
        lock(&self.state).encoder.reset();
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn create(&self, shape: &dyn Shape) -> Result<usize, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        let mut guard = lock(&self.state);
        let CollatingState { encoder, packet } = &mut *guard;
        encode_create(packet, shape, |bytes| {
            encoder.add(bytes)?;
            Ok(bytes.len())
        })
    }

    fn destroy(&self, shape: &dyn Shape) -> Result<usize, ConnectionError> {
        self.append(|packet| shape.write_destroy(packet))
    }

    fn update(&self, shape: &dyn Shape) -> Result<usize, ConnectionError> {
        self.append(|packet| shape.write_update(packet))
    }

    fn update_frame(&self, _dt: f32, _flush_transient: bool) -> Result<usize, ConnectionError> {
        Err(ConnectionError::Unsupported("update_frame"))
    }

    fn update_transfers(&self, _byte_limit: usize) -> Result<usize, ConnectionError> {
        Err(ConnectionError::Unsupported("update_transfers"))
    }

    fn add_resource(&self, _resource: Arc<dyn Resource>) -> Result<u32, ConnectionError> {
        Err(ConnectionError::Unsupported("add_resource"))
    }

    fn remove_resource(&self, _resource: &dyn Resource) -> Result<u32, ConnectionError> {
        Err(ConnectionError::Unsupported("remove_resource"))
    }

    fn reference_count(&self, _resource: &dyn Resource) -> u32 {
        0
    }

    fn send_server_info(&self, _info: &ServerInfoMessage) -> Result<usize, ConnectionError> {
        Err(ConnectionError::Unsupported("send_server_info"))
    }

    fn send(&self, bytes: &[u8], _allow_collation: bool) -> Result<usize, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        lock(&self.state).encoder.add(bytes)?;
        Ok(bytes.len())
    }
}

fn read_exact(stream: &mut dyn Read, buf: &mut [u8]) -> Result<(), CollationError> {
    stream.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => CollationError::Truncated,
        _ => CollationError::Io(e),
    })
}

fn read_inner(stream: &mut dyn Read) -> Result<PacketBuffer, CollationError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    read_exact(stream, &mut header_bytes)?;
    let header = PacketHeader::parse(&header_bytes).ok_or(CollationError::Truncated)?;
    if !header.is_valid() {
        return Err(CollationError::InvalidPacket);
    }

    let mut data = vec![0u8; header.data_size()];
    read_exact(stream, &mut data)?;
    let crc = if header.has_crc() {
        let mut crc = [0u8; CRC_SIZE];
        read_exact(stream, &mut crc)?;
        Some(u16::from_be_bytes(crc))
    } else {
        None
    };
    Ok(PacketBuffer::from_parts(header, &data, crc))
}
