//! Byte-stream connection abstraction.
//!
//! Sessions only need to read, write and close an opaque channel. The
//! [`Connection`] trait captures exactly that, with an implementation for
//! [`TcpStream`]. Tests substitute scripted in-memory connections.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::trace;

/// A bidirectional byte channel owned by one session.
pub trait Connection: Send {
    /// Read up to `buf.len()` bytes.
    ///
    /// `Ok(0)` means the peer closed the stream. Implementations with a read
    /// timeout report it as [`io::ErrorKind::WouldBlock`] or
    /// [`io::ErrorKind::TimedOut`]; the frame reader treats both as a chance
    /// to check for a stop request and then continues.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Release the underlying channel. Further reads and writes fail.
    fn close(&mut self);

    /// Human-readable peer identity for logging.
    fn peer(&self) -> String {
        String::from("unknown")
    }
}

/// Socket options applied to each accepted TCP connection.
#[derive(Debug, Clone, Copy)]
pub struct TcpOptions {
    /// Read timeout; bounds how long a session waits before re-checking the stop flag.
    pub read_timeout: Duration,
    /// Write timeout for responses.
    pub write_timeout: Duration,
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
}

/// [`Connection`] over an accepted [`TcpStream`].
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: String,
}

impl TcpConnection {
    /// Wrap an accepted stream and apply `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if a socket option cannot be set.
    pub fn new(stream: TcpStream, options: TcpOptions) -> io::Result<Self> {
        // Accepted sockets can inherit non-blocking mode from the listener.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(options.read_timeout))?;
        stream.set_write_timeout(Some(options.write_timeout))?;
        stream.set_nodelay(options.nodelay)?;

        let peer = stream
            .peer_addr()
            .map_or_else(|_| String::from("unknown"), |addr| addr.to_string());

        Ok(Self { stream, peer })
    }
}

impl Connection for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data)?;
        self.stream.flush()
    }

    fn close(&mut self) {
        trace!(peer = %self.peer, "Closing TCP connection");
        // The peer may already be gone; nothing useful to do on failure.
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
