//! Server-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared by the accept loop and every session.
#[derive(Debug, Default)]
pub struct ServerStats {
    sessions_accepted: AtomicU64,
    sessions_rejected: AtomicU64,
    sessions_active: AtomicU64,
    requests: AtomicU64,
    exceptions: AtomicU64,
    framing_errors: AtomicU64,
}

impl ServerStats {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn session_opened(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn session_rejected(&self) {
        self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn request_handled(&self, exception: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if exception {
            self.exceptions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of sessions currently running.
    #[must_use]
    pub fn active_sessions(&self) -> u64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
        }
    }
}

/// Immutable copy of [`ServerStats`] for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections that got a session.
    pub sessions_accepted: u64,
    /// Connections closed immediately: `max_sessions` reached or socket setup failed.
    pub sessions_rejected: u64,
    /// Sessions still running.
    pub sessions_active: u64,
    /// Requests answered, including exceptions.
    pub requests: u64,
    /// Requests answered with an exception.
    pub exceptions: u64,
    /// Sessions closed by a bad length field.
    pub framing_errors: u64,
}

impl StatsSnapshot {
    /// Requests answered successfully.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.requests.saturating_sub(self.exceptions)
    }
}
