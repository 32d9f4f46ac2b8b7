//! Signal handling for graceful daemon shutdown.
//!
//! SIGTERM and SIGINT request shutdown; SIGHUP requests a configuration
//! reload. The handlers only store into atomics, which is async-signal-safe;
//! the main loop polls them through [`SignalHandler`].

use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use tracing::{debug, info};

/// Signal number that requested shutdown, 0 while none has.
static SHUTDOWN_SIGNAL: AtomicI32 = AtomicI32::new(0);
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM - Graceful termination request.
    Terminate,
    /// SIGINT - Interrupt (Ctrl+C).
    Interrupt,
    /// SIGHUP - Hangup, used for config reload.
    Hangup,
}

impl SignalKind {
    fn from_raw(signal: c_int) -> Option<Self> {
        match signal {
            libc::SIGTERM => Some(Self::Terminate),
            libc::SIGINT => Some(Self::Interrupt),
            libc::SIGHUP => Some(Self::Hangup),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM"),
            SignalKind::Interrupt => write!(f, "SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Why the daemon is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// A termination signal arrived.
    Signal(SignalKind),
    /// Requested from inside the process.
    Manual,
}

impl std::fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownCause::Signal(kind) => write!(f, "{kind}"),
            ShutdownCause::Manual => write!(f, "manual request"),
        }
    }
}

/// Handle to the process-wide signal flags.
#[derive(Debug)]
pub struct SignalHandler {
    manual_shutdown: AtomicBool,
}

impl SignalHandler {
    /// Register handlers for SIGTERM, SIGINT and SIGHUP.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a handler cannot be installed.
    pub fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        register_unix_handlers()?;

        Ok(Self {
            manual_shutdown: AtomicBool::new(false),
        })
    }

    /// Cause of a pending shutdown request, if any.
    pub fn shutdown_requested(&self) -> Option<ShutdownCause> {
        let raw = SHUTDOWN_SIGNAL.load(Ordering::Relaxed);
        if let Some(kind) = SignalKind::from_raw(raw) {
            return Some(ShutdownCause::Signal(kind));
        }
        self.manual_shutdown
            .load(Ordering::Relaxed)
            .then_some(ShutdownCause::Manual)
    }

    /// Check if reload has been requested (clears the flag).
    pub fn take_reload_request(&self) -> bool {
        RELOAD_REQUESTED.swap(false, Ordering::Relaxed)
    }

    /// Request shutdown from inside the process.
    pub fn request_shutdown(&self) {
        info!("Manual shutdown requested");
        self.manual_shutdown.store(true, Ordering::Relaxed);
    }

    /// Number of handled signals received so far.
    pub fn signal_count(&self) -> u32 {
        SIGNAL_COUNT.load(Ordering::Relaxed)
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn register_unix_handlers() -> std::io::Result<()> {
    extern "C" fn on_shutdown(signal: c_int) {
        SIGNAL_COUNT.fetch_add(1, Ordering::Relaxed);
        SHUTDOWN_SIGNAL.store(signal, Ordering::Relaxed);
    }

    extern "C" fn on_reload(_: c_int) {
        SIGNAL_COUNT.fetch_add(1, Ordering::Relaxed);
        RELOAD_REQUESTED.store(true, Ordering::Relaxed);
    }

    let handlers: [(c_int, extern "C" fn(c_int)); 3] = [
        (libc::SIGTERM, on_shutdown),
        (libc::SIGINT, on_shutdown),
        (libc::SIGHUP, on_reload),
    ];

    for (signal, handler) in handlers {
        // SAFETY: the handlers only touch atomics, which is async-signal-safe.
        let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }

    debug!("Unix signal handlers registered");
    Ok(())
}
