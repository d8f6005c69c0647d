//! Fan-out server over all live client connections.
//!
//! [`TcpServer`] holds the authoritative connection list. The list changes in
//! exactly one place, [`TcpServer::update_connections`], which the producer
//! reaches through [`TcpServer::commit_connections`] on its own thread. Every
//! producer call walks the list under one lock and aggregates the results
//! into a [`FanOut`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collation::CollatedPacketEncoder;
use crate::connection::{Connection, ConnectionError, ConnectionOptions, TcpConnection, lock};
use crate::messages::ServerInfoMessage;
use crate::monitor::{ConnectionMonitor, MonitorMode};
use crate::packet::PacketBuffer;
use crate::platform::SocketConfig;
use crate::shape::{Resource, Shape};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Listener and connection settings for [`TcpServer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to listen on. Default: `0.0.0.0`.
    pub bind_address: IpAddr,
    /// First port to try. Default: 33500.
    pub listen_port: u16,
    /// Additional ports to try after `listen_port`. Default: 0.
    pub port_range: u16,
    /// Collate messages between frame flushes. Default: true.
    pub collate: bool,
    /// Gzip collated packets. Only meaningful with `collate`. Default: false.
    pub compress: bool,
    /// Send end-of-frame messages outside the collation. Default: true.
    pub naked_frame_message: bool,
    /// Background monitor poll interval in milliseconds. Default: 100.
    pub poll_interval_ms: u64,
    /// Socket write timeout in milliseconds; 0 disables it. Default: 5000.
    pub write_timeout_ms: u64,
    /// Disable Nagle's algorithm on client sockets. Default: true.
    pub tcp_nodelay: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 33500,
            port_range: 0,
            collate: true,
            compress: false,
            naked_frame_message: true,
            poll_interval_ms: 100,
            write_timeout_ms: 5000,
            tcp_nodelay: true,
        }
    }
}

impl ServerSettings {
    /// Per-connection options derived from these settings.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            collate: self.collate,
            compress: self.collate && self.compress,
            naked_frame_message: self.naked_frame_message,
        }
    }

    /// Socket options derived from these settings.
    pub fn socket_config(&self) -> SocketConfig {
        SocketConfig {
            tcp_nodelay: self.tcp_nodelay,
            write_timeout: (self.write_timeout_ms > 0)
                .then(|| Duration::from_millis(self.write_timeout_ms)),
            ..SocketConfig::default()
        }
    }
}

impl From<&ServerSettings> for ConnectionOptions {
    fn from(settings: &ServerSettings) -> Self {
        settings.connection_options()
    }
}

// ---------------------------------------------------------------------------
// FanOut
// ---------------------------------------------------------------------------

/// Aggregate result of one producer call across all connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Bytes moved, including what failed calls sent before failing.
    pub bytes: usize,
    /// Peers whose call failed.
    pub failed: Vec<SocketAddr>,
}

impl FanOut {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.failed.len()
    }

    /// Byte count, negated if any connection failed.
    pub fn to_signed(&self) -> i64 {
        let bytes = i64::try_from(self.bytes).unwrap_or(i64::MAX);
        if self.is_ok() { bytes } else { -bytes }
    }
}

// ---------------------------------------------------------------------------
// TcpServer
// ---------------------------------------------------------------------------

type ConnectionCallback = Box<dyn FnMut(&TcpServer, &TcpConnection) + Send>;

/// Producer-facing server that mirrors each call to every client.
pub struct TcpServer {
    monitor: ConnectionMonitor,
    connections: Mutex<Vec<Arc<TcpConnection>>>,
    info: ServerInfoMessage,
    active: AtomicBool,
    on_new_connection: Mutex<Option<ConnectionCallback>>,
}

impl TcpServer {
    /// Create a server. Call `monitor().start(..)` to begin listening.
    pub fn new(settings: ServerSettings, info: ServerInfoMessage) -> Self {
        Self {
            monitor: ConnectionMonitor::new(settings),
            connections: Mutex::new(Vec::new()),
            info,
            active: AtomicBool::new(true),
            on_new_connection: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        self.monitor.settings()
    }

    pub fn server_info(&self) -> &ServerInfoMessage {
        &self.info
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// Listening port while the monitor runs, otherwise zero.
    pub fn port(&self) -> u16 {
        if self.monitor.mode() == MonitorMode::Inactive {
            0
        } else {
            self.monitor.listen_port()
        }
    }

    /// An inactive server ignores producer calls and connection commits.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// True if any client is committed.
    pub fn is_connected(&self) -> bool {
        !lock(&self.connections).is_empty()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Snapshot of the committed connections.
    pub fn connections(&self) -> Vec<Arc<TcpConnection>> {
        lock(&self.connections).clone()
    }

    pub fn connection(&self, index: usize) -> Option<Arc<TcpConnection>> {
        lock(&self.connections).get(index).cloned()
    }

    /// Callback run for each newly committed connection, after its handshake.
    pub fn set_connection_callback(
        &self,
        callback: impl FnMut(&TcpServer, &TcpConnection) + Send + 'static,
    ) {
        *lock(&self.on_new_connection) = Some(Box::new(callback));
    }

    pub fn clear_connection_callback(&self) {
        *lock(&self.on_new_connection) = None;
    }

    /// Stop the monitor and close every committed connection.
    pub fn close(&self) {
        self.monitor.stop();
        self.monitor.join();
        for connection in lock(&self.connections).drain(..) {
            connection.close();
        }
        tracing::info!("server closed");
    }

    // --- connection list -------------------------------------------------

    /// Replace the committed list with `connections`.
    ///
    /// Entries not already present (by identity) receive the server info
    /// handshake and are passed to `on_new`, after the swap. Returns the number
    /// of new connections.
    pub fn update_connections(
        &self,
        connections: &[Arc<TcpConnection>],
        mut on_new: impl FnMut(&TcpServer, &TcpConnection),
    ) -> usize {
        if !self.is_active() {
            return 0;
        }
        let added: Vec<Arc<TcpConnection>> = {
            let mut current = lock(&self.connections);
            let added = connections
                .iter()
                .filter(|candidate| !current.iter().any(|c| Arc::ptr_eq(c, candidate)))
                .cloned()
                .collect();
            let removed = current
                .iter()
                .filter(|c| !connections.iter().any(|n| Arc::ptr_eq(n, c)))
                .count();
            if removed > 0 {
                tracing::debug!(removed, "dropping expired connections");
            }
            *current = connections.to_vec();
            added
        };

        for connection in &added {
            tracing::info!(peer = %connection.peer_addr(), "client connected");
            if let Err(e) = connection.send_server_info(&self.info) {
                tracing::warn!(peer = %connection.peer_addr(), error = %e, "handshake failed");
            }
            on_new(self, connection);
        }
        added.len()
    }

    /// Commit the monitor's working list, notifying new connections through
    /// the registered callback. Returns the number of new connections.
    ///
    /// The callback runs with no server or monitor lock held, so it may call
    /// back into the server.
    pub fn commit_connections(&self) -> usize {
        let snapshot = self.monitor.connections();
        let mut callback = lock(&self.on_new_connection).take();
        let added = self.update_connections(&snapshot, |server, connection| {
            if let Some(callback) = callback.as_mut() {
                callback(server, connection);
            }
        });
        let mut slot = lock(&self.on_new_connection);
        if slot.is_none() {
            *slot = callback;
        }
        added
    }

    // --- fan-out ----------------------------------------------------------

    fn fan_out(
        &self,
        op: &'static str,
        mut call: impl FnMut(&TcpConnection) -> Result<usize, ConnectionError>,
    ) -> FanOut {
        let mut result = FanOut::default();
        if !self.is_active() {
            return result;
        }
        let connections = lock(&self.connections);
        for connection in connections.iter() {
            match call(connection) {
                Ok(bytes) => result.bytes += bytes,
                Err(ConnectionError::Disconnected) => {
                    tracing::trace!(peer = %connection.peer_addr(), op, "skipping closed connection");
                    result.failed.push(connection.peer_addr());
                }
                Err(e) => {
                    tracing::warn!(peer = %connection.peer_addr(), op, error = %e, "connection call failed");
                    result.bytes += e.sent_bytes();
                    result.failed.push(connection.peer_addr());
                }
            }
        }
        result
    }

    pub fn create(&self, shape: &dyn Shape) -> FanOut {
        self.fan_out("create", |c| c.create(shape))
    }

    pub fn destroy(&self, shape: &dyn Shape) -> FanOut {
        self.fan_out("destroy", |c| c.destroy(shape))
    }

    pub fn update(&self, shape: &dyn Shape) -> FanOut {
        self.fan_out("update", |c| c.update(shape))
    }

    /// Send finalised packet bytes to every client.
    pub fn send(&self, bytes: &[u8], allow_collation: bool) -> FanOut {
        self.fan_out("send", |c| c.send(bytes, allow_collation))
    }

    pub fn send_packet(&self, packet: &PacketBuffer, allow_collation: bool) -> FanOut {
        self.fan_out("send", |c| c.send_packet(packet, allow_collation))
    }

    /// Send each packet of an uncompressed collation to every client.
    pub fn send_collated(&self, collated: &CollatedPacketEncoder) -> FanOut {
        self.fan_out("send_collated", |c| c.send_collated(collated))
    }

    /// End the frame on every client.
    ///
    /// With an asynchronous monitor, connections accepted during the frame
    /// are committed afterwards, so their handshake and callback follow the
    /// flushed frame.
    pub fn update_frame(&self, dt: f32, flush_transient: bool) -> FanOut {
        let result = self.fan_out("update_frame", |c| c.update_frame(dt, flush_transient));
        if self.is_active() && self.monitor.mode() == MonitorMode::Asynchronous {
            self.commit_connections();
        }
        result
    }

    pub fn update_transfers(&self, byte_limit: usize) -> FanOut {
        self.fan_out("update_transfers", |c| c.update_transfers(byte_limit))
    }

    /// Reference `resource` on every client. Returns the count reported by the
    /// last connection.
    pub fn add_resource(&self, resource: &Arc<dyn Resource>) -> u32 {
        self.resource_fan_out(|c| c.add_resource(Arc::clone(resource)))
    }

    /// Release `resource` on every client. Returns the count reported by the
    /// last connection.
    pub fn remove_resource(&self, resource: &dyn Resource) -> u32 {
        self.resource_fan_out(|c| c.remove_resource(resource))
    }

    fn resource_fan_out(
        &self,
        mut call: impl FnMut(&TcpConnection) -> Result<u32, ConnectionError>,
    ) -> u32 {
        if !self.is_active() {
            return 0;
        }
        let mut last = 0;
        for connection in lock(&self.connections).iter() {
            match call(connection) {
                Ok(count) => last = count,
                Err(e) => {
                    tracing::warn!(peer = %connection.peer_addr(), error = %e, "resource call failed");
                }
            }
        }
        last
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.close();
    }
}
