//! TCP accept loop and server lifecycle.
//!
//! The server binds a non-blocking listener and polls it from a dedicated
//! thread so a stop request is noticed promptly. Each accepted connection
//! runs in its own session thread; the accept thread owns those handles and
//! joins them before it exits, so joining the accept thread is enough to
//! know no session is left running.

use crate::connection::{TcpConnection, TcpOptions};
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::session::Session;
use crate::stats::{ServerStats, StatsSnapshot};
use crate::store::RegisterStore;
use mbtcp_common::config::{ResponderConfig, ServerConfig};
use mbtcp_common::error::{MbError, MbResult};
use mbtcp_common::state::ServerState;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Sleep between polls of an idle listener.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Sleep after an accept error other than `WouldBlock`.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Modbus/TCP server: one accept thread plus one thread per session.
pub struct Server {
    config: ServerConfig,
    dispatcher: Dispatcher,
    state: ServerState,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    local_addr: Option<SocketAddr>,
    accept_thread: Option<JoinHandle<()>>,
}

/// Everything the accept thread needs, moved into it at start.
struct AcceptLoop {
    listener: TcpListener,
    dispatcher: Dispatcher,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    tcp: TcpOptions,
    max_sessions: u64,
    sessions: Vec<JoinHandle<()>>,
    next_session: u64,
}

impl Server {
    /// Create a stopped server over `store`.
    #[must_use]
    pub fn new(store: Arc<RegisterStore>, config: ServerConfig, options: DispatchOptions) -> Self {
        Self {
            config,
            dispatcher: Dispatcher::new(store, options),
            state: ServerState::Stopped,
            stop: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ServerStats::new()),
            local_addr: None,
            accept_thread: None,
        }
    }

    /// Create a stopped server, building its store from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`MbError::Config`] if the configuration is invalid.
    pub fn from_config(config: &ResponderConfig) -> MbResult<Self> {
        config
            .validate()
            .map_err(|e| MbError::Config(e.to_string()))?;
        let store = RegisterStore::from_config(&config.registers)?;
        Ok(Self::new(
            Arc::new(store),
            config.server.clone(),
            DispatchOptions::from(&config.compat),
        ))
    }

    /// Bind the listener and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`MbError::InvalidStateTransition`] unless the server is
    /// stopped, [`MbError::Config`] if a socket timeout is zero,
    /// [`MbError::Bind`] if the address cannot be bound, or an I/O error if
    /// the accept thread cannot be spawned.
    pub fn start(&mut self) -> MbResult<()> {
        let mut next = self.state;
        next.transition_to(ServerState::Running)?;
        self.config
            .validate()
            .map_err(|e| MbError::Config(e.to_string()))?;

        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(addr).map_err(|e| MbError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.stop = Arc::new(AtomicBool::new(false));
        let accept = AcceptLoop {
            listener,
            dispatcher: self.dispatcher.clone(),
            stop: Arc::clone(&self.stop),
            stats: Arc::clone(&self.stats),
            tcp: TcpOptions {
                read_timeout: self.config.poll_interval,
                write_timeout: self.config.write_timeout,
                nodelay: self.config.nodelay,
            },
            max_sessions: u64::try_from(self.config.max_sessions).unwrap_or(u64::MAX),
            sessions: Vec::new(),
            next_session: 0,
        };

        let handle = thread::Builder::new()
            .name("mbtcp-accept".into())
            .spawn(move || accept.run())?;

        self.accept_thread = Some(handle);
        self.local_addr = Some(local_addr);
        self.state = next;

        info!(
            addr = %local_addr,
            registers = self.dispatcher.store().len(),
            max_sessions = self.config.max_sessions,
            "Modbus/TCP server listening"
        );
        Ok(())
    }

    /// Ask the accept loop and every session to finish. Does not wait.
    pub fn stop(&mut self) {
        if self.state.transition_to(ServerState::Stopping).is_err() {
            debug!(state = %self.state, "Stop ignored");
            return;
        }
        info!("Stopping Modbus/TCP server");
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop and wait until the accept loop and all sessions have exited.
    pub fn shutdown(&mut self) {
        self.stop();

        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                error!("Accept thread panicked");
            }
        }

        if self.state.transition_to(ServerState::Stopped).is_ok() {
            let stats = self.stats.snapshot();
            info!(
                sessions = stats.sessions_accepted,
                requests = stats.requests,
                exceptions = stats.exceptions,
                "Modbus/TCP server stopped"
            );
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Address actually bound, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Snapshot of the server counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The shared register store.
    #[must_use]
    pub fn store(&self) -> &Arc<RegisterStore> {
        self.dispatcher.store()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl AcceptLoop {
    fn run(mut self) {
        while !self.stop.load(Ordering::SeqCst) {
            self.reap_finished();

            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }

        // Close the listening socket before waiting on sessions.
        drop(self.listener);
        debug!(sessions = self.sessions.len(), "Waiting for sessions to finish");
        for handle in self.sessions {
            if handle.join().is_err() {
                error!("Session thread panicked");
            }
        }
    }

    fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.sessions.drain(..).partition(JoinHandle::is_finished);
        self.sessions = running;
        for handle in finished {
            if handle.join().is_err() {
                error!("Session thread panicked");
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.max_sessions != 0 && self.stats.active_sessions() >= self.max_sessions {
            warn!(
                peer = %peer,
                max_sessions = self.max_sessions,
                "Session limit reached, rejecting connection"
            );
            self.stats.session_rejected();
            // Best effort; the socket is dropped either way.
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        let conn = match TcpConnection::new(stream, self.tcp) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to configure connection");
                self.stats.session_rejected();
                return;
            }
        };

        let id = self.next_session;
        self.next_session += 1;

        let mut session = Session::new(
            conn,
            self.dispatcher.clone(),
            Arc::clone(&self.stop),
            Arc::clone(&self.stats),
        );
        let stats = Arc::clone(&self.stats);
        stats.session_opened();

        let spawned = thread::Builder::new()
            .name(format!("mbtcp-session-{id}"))
            .spawn(move || {
                session.run();
                stats.session_closed();
            });

        match spawned {
            Ok(handle) => self.sessions.push(handle),
            Err(e) => {
                error!(peer = %peer, error = %e, "Failed to spawn session thread");
                self.stats.session_closed();
            }
        }
    }
}
