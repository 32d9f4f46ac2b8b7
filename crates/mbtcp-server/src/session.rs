//! Per-connection request loop.
//!
//! A session reads one frame, dispatches it, writes the reply and repeats,
//! so requests on one connection are answered strictly in arrival order.
//! It ends on end-of-stream, a framing or transport error, a failed write,
//! or a server stop request, and always closes its connection on the way out.

use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::frame::{read_frame, FrameError};
use crate::stats::ServerStats;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the stream.
    PeerClosed,
    /// The server asked every session to stop.
    Stopped,
    /// The peer sent a length field outside the allowed range.
    Framing(u16),
    /// Reading or writing failed.
    Io(io::ErrorKind),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed"),
            Self::Stopped => write!(f, "server stopping"),
            Self::Framing(length) => write!(f, "invalid length field {length}"),
            Self::Io(kind) => write!(f, "I/O error: {kind}"),
        }
    }
}

/// One client connection being served.
pub struct Session<C: Connection> {
    conn: C,
    peer: String,
    dispatcher: Dispatcher,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    requests: u64,
}

impl<C: Connection> Session<C> {
    /// Create a session over `conn`.
    pub fn new(
        conn: C,
        dispatcher: Dispatcher,
        stop: Arc<AtomicBool>,
        stats: Arc<ServerStats>,
    ) -> Self {
        let peer = conn.peer();
        Self {
            conn,
            peer,
            dispatcher,
            stop,
            stats,
            requests: 0,
        }
    }

    /// Requests answered so far.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// The underlying connection.
    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Serve requests until the session ends, then close the connection.
    pub fn run(&mut self) -> SessionEnd {
        debug!(peer = %self.peer, "Session opened");

        let end = loop {
            if self.stop.load(Ordering::SeqCst) {
                break SessionEnd::Stopped;
            }

            let frame = match read_frame(&mut self.conn, &self.stop) {
                Ok(frame) => frame,
                Err(FrameError::Closed) => break SessionEnd::PeerClosed,
                Err(FrameError::Stopped) => break SessionEnd::Stopped,
                Err(FrameError::InvalidLength(length)) => {
                    warn!(peer = %self.peer, length, "Invalid MBAP length, closing session");
                    self.stats.framing_error();
                    break SessionEnd::Framing(length);
                }
                Err(FrameError::Io(e)) => {
                    debug!(peer = %self.peer, error = %e, "Read failed");
                    break SessionEnd::Io(e.kind());
                }
            };

            let reply = self.dispatcher.dispatch(&frame);
            self.requests += 1;
            self.stats.request_handled(reply.exception.is_some());

            if let Err(e) = self.conn.write_all(&reply.bytes) {
                warn!(peer = %self.peer, error = %e, "Failed to write reply, closing session");
                break SessionEnd::Io(e.kind());
            }
            trace!(peer = %self.peer, bytes = reply.bytes.len(), "Reply sent");
        };

        self.conn.close();
        debug!(
            peer = %self.peer,
            reason = %end,
            requests = self.requests,
            "Session closed"
        );
        end
    }
}
