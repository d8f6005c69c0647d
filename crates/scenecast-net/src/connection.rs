//! Per-client protocol session.
//!
//! [`TcpConnection`] encodes shape messages for one client socket, optionally
//! collating and compressing them, and streams shared resources within a per
//! call byte budget.
//!
//! Three locks keep unrelated work apart:
//!
//! | lock        | guards                                          |
//! |-------------|-------------------------------------------------|
//! | `packet`    | the [`PacketBuffer`] used to compose messages   |
//! | `send`      | the socket, the collation encoder, flush state  |
//! | `resources` | the [`ResourceRegistry`] and its scratch packet |
//!
//! Lock order is `packet` then `send`, or `resources` then `send`. `packet`
//! and `resources` are never held at the same time.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::collation::{CollatedPacketEncoder, CollationError};
use crate::messages::{
    ControlId, ControlMessage, END_FRAME_PERSIST, ServerInfoMessage, WireMessage, routing,
};
use crate::packet::{PacketBuffer, PacketError, PacketHeader};
use crate::platform;
use crate::resources::ResourceRegistry;
use crate::shape::{DataProgress, Resource, Shape, ShapeError, TransferProgress};
use crate::stats::{ConnectionStats, StatsSnapshot};

/// Errors returned by [`Connection`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// A socket write failed. The connection is now disconnected.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection has no live socket.
    #[error("connection closed")]
    Disconnected,
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),
    #[error("collation error: {0}")]
    Collation(#[from] CollationError),
    /// The operation is not available on this kind of connection.
    #[error("{0} is not supported by this connection")]
    Unsupported(&'static str),
    /// A call failed after part of its output had already been sent.
    #[error("{source} after {sent} bytes")]
    Partial {
        sent: usize,
        source: Box<ConnectionError>,
    },
}

impl ConnectionError {
    /// Bytes that reached the send path before the failure.
    pub fn sent_bytes(&self) -> usize {
        match self {
            Self::Partial { sent, .. } => *sent,
            _ => 0,
        }
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Connection trait
// ---------------------------------------------------------------------------

/// Producer-facing operations on one client stream.
///
/// Byte counts are the packet bytes handed to the send path, measured before
/// any compression.
pub trait Connection: Send + Sync {
    /// Peer address, or a descriptive name for non-socket connections.
    fn address(&self) -> String;

    /// Peer port; zero for non-socket connections.
    fn port(&self) -> u16;

    fn is_connected(&self) -> bool;

    /// Flush pending data and close the transport.
    fn close(&self);

    /// Inactive connections accept every call and send nothing.
    fn set_active(&self, active: bool);

    fn is_active(&self) -> bool;

    /// Send a shape's create message, its bulk data if any, and reference its
    /// resources. Transient shapes never reference resources.
    fn create(&self, shape: &dyn Shape) -> Result<usize, ConnectionError>;

    /// Release a shape's resources, then send its destroy message.
    fn destroy(&self, shape: &dyn Shape) -> Result<usize, ConnectionError>;

    fn update(&self, shape: &dyn Shape) -> Result<usize, ConnectionError>;

    /// End the frame, `dt` seconds after the previous one, and flush any
    /// collated data. With `flush_transient` false the client keeps transient
    /// shapes alive into the next frame.
    fn update_frame(&self, dt: f32, flush_transient: bool) -> Result<usize, ConnectionError>;

    /// Stream queued resources until `byte_limit` bytes have been sent, or
    /// until the queue is empty when `byte_limit` is zero. A failure after some
    /// bytes were sent is reported as [`ConnectionError::Partial`].
    fn update_transfers(&self, byte_limit: usize) -> Result<usize, ConnectionError>;

    /// Add a reference to `resource`, returning the new count.
    fn add_resource(&self, resource: Arc<dyn Resource>) -> Result<u32, ConnectionError>;

    /// Drop a reference to `resource`, returning the remaining count.
    fn remove_resource(&self, resource: &dyn Resource) -> Result<u32, ConnectionError>;

    fn reference_count(&self, resource: &dyn Resource) -> u32;

    /// Send the handshake. Never collated.
    fn send_server_info(&self, info: &ServerInfoMessage) -> Result<usize, ConnectionError>;

    /// Send the bytes of one or more finalised packets.
    fn send(&self, bytes: &[u8], allow_collation: bool) -> Result<usize, ConnectionError>;

    fn send_packet(
        &self,
        packet: &PacketBuffer,
        allow_collation: bool,
    ) -> Result<usize, ConnectionError> {
        self.send(packet.data()?, allow_collation)
    }
}

/// Write a create message and any bulk data packets for `shape`, handing each
/// finalised packet to `emit`.
pub(crate) fn encode_create(
    packet: &mut PacketBuffer,
    shape: &dyn Shape,
    mut emit: impl FnMut(&[u8]) -> Result<usize, ConnectionError>,
) -> Result<usize, ConnectionError> {
    shape.write_create(packet)?;
    packet.finalise()?;
    let mut total = emit(packet.data()?)?;

    if shape.is_complex() {
        let mut progress = TransferProgress::default();
        loop {
            let step = shape.write_data(packet, &mut progress)?;
            packet.finalise()?;
            total += emit(packet.data()?)?;
            if step == DataProgress::Done {
                break;
            }
        }
    }
    Ok(total)
}

/// Split the collated region of `bytes` into whole packets.
pub(crate) fn split_packets(bytes: &[u8]) -> Result<Vec<&[u8]>, ConnectionError> {
    let mut out = Vec::new();
    let mut at = 0;
    while at < bytes.len() {
        let header = PacketHeader::parse(&bytes[at..]).ok_or(CollationError::Truncated)?;
        let end = at + header.total_size();
        if !header.is_valid() {
            return Err(CollationError::InvalidPacket.into());
        }
        if end > bytes.len() {
            return Err(CollationError::Truncated.into());
        }
        out.push(&bytes[at..end]);
        at = end;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// TcpConnection
// ---------------------------------------------------------------------------

/// Per-connection behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Pack messages into collated packets between frame flushes.
    pub collate: bool,
    /// Gzip collated packets. Requires `collate`.
    pub compress: bool,
    /// Send the end-of-frame message on its own, after flushing collated data.
    pub naked_frame_message: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            collate: true,
            compress: false,
            naked_frame_message: true,
        }
    }
}

struct SendState {
    stream: Option<TcpStream>,
    collation: Option<CollatedPacketEncoder>,
}

struct ResourceState {
    registry: ResourceRegistry,
    scratch: PacketBuffer,
}

/// A [`Connection`] over a TCP socket.
pub struct TcpConnection {
    peer: SocketAddr,
    options: ConnectionOptions,
    packet: Mutex<PacketBuffer>,
    send: Mutex<SendState>,
    resources: Mutex<ResourceState>,
    connected: AtomicBool,
    active: AtomicBool,
    time_unit: AtomicU64,
    stats: ConnectionStats,
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .field("options", &self.options)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl TcpConnection {
    /// Wrap an accepted, configured socket.
    pub fn new(stream: TcpStream, options: ConnectionOptions) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        let collation = options
            .collate
            .then(|| CollatedPacketEncoder::new(options.compress));
        Ok(Self {
            peer,
            options,
            packet: Mutex::new(PacketBuffer::new()),
            send: Mutex::new(SendState {
                stream: Some(stream),
                collation,
            }),
            resources: Mutex::new(ResourceState {
                registry: ResourceRegistry::new(),
                scratch: PacketBuffer::new(),
            }),
            connected: AtomicBool::new(true),
            active: AtomicBool::new(true),
            time_unit: AtomicU64::new(ServerInfoMessage::default().time_unit),
            stats: ConnectionStats::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn options(&self) -> ConnectionOptions {
        self.options
    }

    /// Traffic counters so far.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Resources currently referenced.
    pub fn resource_count(&self) -> usize {
        lock(&self.resources).registry.len()
    }

    /// Probe the socket and mark the connection disconnected if the peer has
    /// gone. Returns the connected state.
    pub fn check_peer(&self) -> bool {
        let state = lock(&self.send);
        if let Some(stream) = state.stream.as_ref() {
            if self.is_connected() && platform::peer_closed(stream) {
                tracing::debug!(peer = %self.peer, "peer closed connection");
                self.connected.store(false, Ordering::Release);
            }
        }
        self.is_connected()
    }

    /// Flush collated data now.
    pub fn flush(&self) -> Result<usize, ConnectionError> {
        let mut state = lock(&self.send);
        self.flush_collated(&mut state)
    }

    /// Send each packet of an uncompressed, unfinalised collation.
    pub fn send_collated(&self, collated: &CollatedPacketEncoder) -> Result<usize, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        let Some(bytes) = collated.collated_region() else {
            return Err(ConnectionError::Unsupported("sending a compressed collation"));
        };
        let _packet = lock(&self.packet);
        let mut total = 0;
        for packet in split_packets(bytes)? {
            total += self.send_bytes(packet, true)?;
        }
        Ok(total)
    }

    fn seconds_to_time_units(&self, seconds: f32) -> u32 {
        ServerInfoMessage {
            time_unit: self.time_unit.load(Ordering::Relaxed),
            ..ServerInfoMessage::default()
        }
        .to_time_units(seconds)
    }

    fn fail(&self, error: std::io::Error) -> ConnectionError {
        tracing::warn!(peer = %self.peer, error = %error, "socket write failed");
        self.stats.record_failure();
        self.connected.store(false, Ordering::Release);
        ConnectionError::Io(error)
    }

    fn write_socket(&self, state: &mut SendState, bytes: &[u8]) -> Result<usize, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Disconnected);
        }
        let Some(stream) = state.stream.as_mut() else {
            return Err(ConnectionError::Disconnected);
        };
        if let Err(e) = stream.write_all(bytes) {
            return Err(self.fail(e));
        }
        self.stats.record_write(bytes.len() as u64);
        Ok(bytes.len())
    }

    fn flush_collated(&self, state: &mut SendState) -> Result<usize, ConnectionError> {
        let Some(mut collation) = state.collation.take() else {
            return Ok(0);
        };
        let result = if collation.is_empty() {
            Ok(0)
        } else {
            let written = collation
                .finalise()
                .map_err(ConnectionError::from)
                .and_then(|_| {
                    let bytes = collation.data()?;
                    self.write_socket(state, bytes)
                });
            self.stats.record_flush();
            collation.reset();
            written
        };
        state.collation = Some(collation);
        result
    }

    fn write_direct(&self, state: &mut SendState, bytes: &[u8]) -> Result<usize, ConnectionError> {
        self.flush_collated(state)?;
        self.write_socket(state, bytes)
    }

    fn write_packet(
        &self,
        state: &mut SendState,
        bytes: &[u8],
        allow_collation: bool,
    ) -> Result<usize, ConnectionError> {
        self.stats.record_packet(bytes.len() as u64);
        if !allow_collation || state.collation.is_none() {
            return self.write_direct(state, bytes);
        }

        let added = match state.collation.as_mut() {
            Some(collation) => collation.add(bytes),
            None => return self.write_direct(state, bytes),
        };
        match added {
            Ok(()) => Ok(bytes.len()),
            Err(CollationError::Full { .. }) => {
                self.flush_collated(state)?;
                match state.collation.as_mut().map(|c| c.add(bytes)) {
                    Some(Ok(())) => Ok(bytes.len()),
                    _ => self.write_socket(state, bytes),
                }
            }
            Err(CollationError::PacketTooLarge { .. }) => self.write_direct(state, bytes),
            Err(e) => Err(e.into()),
        }
    }

    fn send_bytes(&self, bytes: &[u8], allow_collation: bool) -> Result<usize, ConnectionError> {
        let mut state = lock(&self.send);
        self.write_packet(&mut state, bytes, allow_collation)
    }
}

impl Connection for TcpConnection {
    fn address(&self) -> String {
        self.peer.ip().to_string()
    }

    fn port(&self) -> u16 {
        self.peer.port()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn close(&self) {
        let mut state = lock(&self.send);
        if self.is_connected() {
            if let Err(e) = self.flush_collated(&mut state) {
                tracing::debug!(peer = %self.peer, error = %e, "flush on close failed");
            }
        }
        if let Some(stream) = state.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            tracing::debug!(peer = %self.peer, "connection closed");
        }
        self.connected.store(false, Ordering::Release);
        drop(state);
        lock(&self.resources).registry.clear();
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
        let written = {
            let mut packet = lock(&self.packet);
            encode_create(&mut packet, shape, |bytes| self.send_bytes(bytes, true))?
        };

        if !shape.is_transient() {
            for resource in shape.resources() {
                self.add_resource(resource)?;
            }
        }
        Ok(written)
    }

    fn destroy(&self, shape: &dyn Shape) -> Result<usize, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        if !shape.is_transient() {
            for resource in shape.resources() {
                self.remove_resource(resource.as_ref())?;
            }
        }

        let mut packet = lock(&self.packet);
        shape.write_destroy(&mut packet)?;
        packet.finalise()?;
        self.send_bytes(packet.data()?, true)
    }

    fn update(&self, shape: &dyn Shape) -> Result<usize, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        let mut packet = lock(&self.packet);
        shape.write_update(&mut packet)?;
        packet.finalise()?;
        self.send_bytes(packet.data()?, true)
    }

    fn update_frame(&self, dt: f32, flush_transient: bool) -> Result<usize, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        let message = ControlMessage {
            flags: if flush_transient { 0 } else { END_FRAME_PERSIST },
            value32: self.seconds_to_time_units(dt),
            value64: 0,
        };

        let mut packet = lock(&self.packet);
        packet.reset(routing::CONTROL, ControlId::Frame as u16);
        message.write(&mut packet)?;
        packet.finalise()?;
        let bytes = packet.data()?;

        let mut state = lock(&self.send);
        if self.options.naked_frame_message {
            self.stats.record_packet(bytes.len() as u64);
            self.write_direct(&mut state, bytes)
        } else {
            let written = self.write_packet(&mut state, bytes, true)?;
            self.flush_collated(&mut state)?;
            Ok(written)
        }
    }

    fn update_transfers(&self, byte_limit: usize) -> Result<usize, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        let mut guard = lock(&self.resources);
        let ResourceState { registry, scratch } = &mut *guard;
        let mut transferred = 0;
        let mut first_error: Option<ConnectionError> = None;

        while byte_limit == 0 || transferred < byte_limit {
            let remaining = if byte_limit == 0 {
                0
            } else {
                byte_limit - transferred
            };
            let step = match registry.next_packet(scratch, remaining) {
                Ok(Some(step)) => step,
                Ok(None) => break,
                Err(e) => {
                    // The failed resource has been dropped from the packer.
                    first_error.get_or_insert(e.into());
                    continue;
                }
            };
            let sent = match scratch.finalise() {
                Ok(()) => match scratch.data() {
                    Ok(data) => self.send_bytes(data, true),
                    Err(e) => Err(e.into()),
                },
                Err(e) => Err(e.into()),
            };
            match sent {
                Ok(_) => transferred += scratch.len(),
                Err(e) => {
                    tracing::warn!(peer = %self.peer, key = step.key, error = %e, "resource packet not sent");
                    let fatal = !self.is_connected();
                    first_error.get_or_insert(e);
                    if fatal {
                        break;
                    }
                }
            }
            if step.completed {
                tracing::trace!(peer = %self.peer, key = step.key, "resource transfer complete");
            }
        }

        match first_error {
            Some(e) if transferred > 0 => Err(ConnectionError::Partial {
                sent: transferred,
                source: Box::new(e),
            }),
            Some(e) => Err(e),
            None => Ok(transferred),
        }
    }

    fn add_resource(&self, resource: Arc<dyn Resource>) -> Result<u32, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        Ok(lock(&self.resources).registry.add(resource))
    }

    fn remove_resource(&self, resource: &dyn Resource) -> Result<u32, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        let mut guard = lock(&self.resources);
        let ResourceState { registry, scratch } = &mut *guard;
        let release = registry.remove(resource.unique_key());
        if release.cancelled {
            tracing::debug!(peer = %self.peer, key = resource.unique_key(), "cancelled resource transfer");
        }
        if let Some(released) = release.destroy {
            released.destroy(scratch)?;
            scratch.finalise()?;
            self.send_bytes(scratch.data()?, true)?;
        }
        Ok(release.ref_count)
    }

    fn reference_count(&self, resource: &dyn Resource) -> u32 {
        lock(&self.resources)
            .registry
            .reference_count(resource.unique_key())
    }

    fn send_server_info(&self, info: &ServerInfoMessage) -> Result<usize, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        self.time_unit.store(info.time_unit, Ordering::Relaxed);
        let mut packet = lock(&self.packet);
        packet.reset(routing::SERVER_INFO, 0);
        info.write(&mut packet)?;
        packet.finalise()?;
        self.send_bytes(packet.data()?, false)
    }

    fn send(&self, bytes: &[u8], allow_collation: bool) -> Result<usize, ConnectionError> {
        if !self.is_active() {
            return Ok(0);
        }
        let _packet = lock(&self.packet);
        self.send_bytes(bytes, allow_collation)
    }
}
