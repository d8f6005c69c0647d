//! Connection monitor: accepts new clients and expires dead ones.
//!
//! The monitor owns the listening socket and a working list of connections.
//! It runs either on the caller's thread, one pass per
//! [`ConnectionMonitor::monitor_connections`] call, or on a background thread
//! that polls until stopped. The working list only reaches the server through
//! [`ConnectionMonitor::commit_connections`], which the producer calls from its
//! own thread.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::connection::{Connection, ConnectionOptions, TcpConnection, lock};
use crate::platform::{self, SocketConfig};
use crate::server::ServerSettings;

/// Monitor operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// Not listening.
    Inactive,
    /// Listening; work happens in explicit `monitor_connections` calls.
    Synchronous,
    /// Listening; a background thread does the work.
    Asynchronous,
}

/// Errors raised when starting the monitor.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The monitor is already running in another mode.
    #[error("monitor already running in {current:?} mode, cannot start {requested:?}")]
    ModeConflict {
        /// Mode the monitor is in.
        current: MonitorMode,
        /// Mode that was requested.
        requested: MonitorMode,
    },
    /// `start` was asked for [`MonitorMode::Inactive`].
    #[error("cannot start monitor in inactive mode")]
    InvalidMode,
    /// No port in the configured range could be bound.
    #[error("failed to listen on ports {first}..={last}: {source}")]
    Bind {
        first: u16,
        last: u16,
        #[source]
        source: std::io::Error,
    },
    /// The background thread could not be spawned.
    #[error("failed to spawn monitor thread: {0}")]
    Spawn(std::io::Error),
}

struct MonitorState {
    mode: MonitorMode,
    listener: Option<TcpListener>,
    listen_port: u16,
    connections: Vec<Arc<TcpConnection>>,
}

struct Shared {
    state: Mutex<MonitorState>,
    wake: Condvar,
    quit: AtomicBool,
    settings: ServerSettings,
    socket: SocketConfig,
    options: ConnectionOptions,
}

impl Shared {
    fn monitor_pass(&self) {
        let mut state = lock(&self.state);

        state.connections.retain(|connection| {
            if connection.check_peer() {
                return true;
            }
            tracing::debug!(peer = %connection.peer_addr(), "expiring connection");
            connection.close();
            false
        });

        let Some(listener) = state.listener.as_ref() else {
            return;
        };
        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let connection = platform::configure_stream(&stream, &self.socket)
                        .and_then(|_| TcpConnection::new(stream, self.options));
                    match connection {
                        Ok(connection) => {
                            tracing::debug!(peer = %addr, "accepted connection");
                            accepted.push(Arc::new(connection));
                        }
                        Err(e) => tracing::warn!(peer = %addr, error = %e, "failed to set up connection"),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
        state.connections.extend(accepted);
    }

    fn stop_listening(&self, state: &mut MonitorState) {
        for connection in state.connections.drain(..) {
            connection.close();
        }
        if state.listener.take().is_some() {
            tracing::debug!(port = state.listen_port, "stopped listening");
        }
        state.listen_port = 0;
        state.mode = MonitorMode::Inactive;
    }

    fn run(&self) {
        tracing::debug!("monitor thread started");
        let interval = Duration::from_millis(self.settings.poll_interval_ms);
        while !self.quit.load(Ordering::Acquire) {
            self.monitor_pass();
            let guard = lock(&self.state);
            let _ = self
                .wake
                .wait_timeout_while(guard, interval, |_| !self.quit.load(Ordering::Acquire))
                .unwrap_or_else(PoisonError::into_inner);
        }
        let mut state = lock(&self.state);
        self.stop_listening(&mut state);
        tracing::debug!("monitor thread exiting");
    }
}

/// Accepts and expires client connections for a server.
pub struct ConnectionMonitor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMonitor {
    /// Create an inactive monitor.
    pub fn new(settings: ServerSettings) -> Self {
        let socket = settings.socket_config();
        let options = settings.connection_options();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MonitorState {
                    mode: MonitorMode::Inactive,
                    listener: None,
                    listen_port: 0,
                    connections: Vec::new(),
                }),
                wake: Condvar::new(),
                quit: AtomicBool::new(false),
                settings,
                socket,
                options,
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.shared.settings
    }

    pub fn mode(&self) -> MonitorMode {
        lock(&self.shared.state).mode
    }

    /// True while a listener is open.
    pub fn is_running(&self) -> bool {
        lock(&self.shared.state).listener.is_some()
    }

    /// The bound port, or zero when not listening.
    pub fn listen_port(&self) -> u16 {
        lock(&self.shared.state).listen_port
    }

    /// Start listening in `mode`.
    ///
    /// Starting in the mode already running is a no-op.
    pub fn start(&self, mode: MonitorMode) -> Result<(), MonitorError> {
        if mode == MonitorMode::Inactive {
            return Err(MonitorError::InvalidMode);
        }
        // Reap a background thread that was stopped but never joined.
        if self.shared.quit.load(Ordering::Acquire) {
            self.join();
        }

        let mut state = lock(&self.shared.state);
        if state.mode == mode {
            return Ok(());
        }
        if state.mode != MonitorMode::Inactive {
            return Err(MonitorError::ModeConflict {
                current: state.mode,
                requested: mode,
            });
        }

        let settings = &self.shared.settings;
        let listener = platform::bind_in_range(
            settings.bind_address,
            settings.listen_port,
            settings.port_range,
            &self.shared.socket,
        )
        .map_err(|source| MonitorError::Bind {
            first: settings.listen_port,
            last: settings.listen_port.saturating_add(settings.port_range),
            source,
        })?;
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        tracing::info!(port, ?mode, "listening for connections");
        state.listener = Some(listener);
        state.listen_port = port;
        state.mode = mode;

        if mode == MonitorMode::Asynchronous {
            self.shared.quit.store(false, Ordering::Release);
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name("scenecast-monitor".into())
                .spawn(move || shared.run());
            match spawned {
                Ok(handle) => *lock(&self.thread) = Some(handle),
                Err(e) => {
                    self.shared.stop_listening(&mut state);
                    return Err(MonitorError::Spawn(e));
                }
            }
        }
        Ok(())
    }

    /// Stop monitoring.
    ///
    /// A synchronous monitor closes its listener and connections immediately.
    /// An asynchronous monitor is signalled to exit; call
    /// [`ConnectionMonitor::join`] to wait for it.
    pub fn stop(&self) {
        let mut state = lock(&self.shared.state);
        match state.mode {
            MonitorMode::Inactive => {}
            MonitorMode::Synchronous => self.shared.stop_listening(&mut state),
            MonitorMode::Asynchronous => {
                self.shared.quit.store(true, Ordering::Release);
                self.shared.wake.notify_all();
            }
        }
    }

    /// Wait for a stopped background thread to exit. No-op without one.
    pub fn join(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if !self.shared.quit.load(Ordering::Acquire) {
                tracing::warn!("join called on a monitor that was not stopped");
                self.stop();
            }
            if handle.join().is_err() {
                tracing::error!("monitor thread panicked");
                let mut state = lock(&self.shared.state);
                self.shared.stop_listening(&mut state);
            }
        }
        self.shared.quit.store(false, Ordering::Release);
    }

    /// Run one accept and expire pass on the caller's thread.
    pub fn monitor_connections(&self) {
        self.shared.monitor_pass();
    }

    /// Wait until at least one connection is present.
    ///
    /// Drives [`ConnectionMonitor::monitor_connections`] itself in synchronous
    /// mode. Returns `false` on timeout or when the monitor is inactive.
    pub fn wait_for_connections(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mode = self.mode();
            if mode == MonitorMode::Synchronous {
                self.monitor_connections();
            }
            if self.connection_count() > 0 {
                return true;
            }
            let now = Instant::now();
            if mode == MonitorMode::Inactive || now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(5)));
        }
    }

    /// Connections in the working list.
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.state).connections.len()
    }

    /// Snapshot of the working list.
    pub fn connections(&self) -> Vec<Arc<TcpConnection>> {
        lock(&self.shared.state).connections.clone()
    }

    /// Hand the working list to `commit` under the monitor lock.
    ///
    /// `commit` must not call back into the monitor.
    pub fn commit_connections<R>(&self, commit: impl FnOnce(&[Arc<TcpConnection>]) -> R) -> R {
        let state = lock(&self.shared.state);
        commit(&state.connections)
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}
