//! Request admission
//!
//! Three gates run before a request is dispatched, in this order:
//!
//! 1. server-wide pending requests below `max_pending_request`
//! 2. requests of the session in the current one-second window at most
//!    `max_session_request_per_second`
//! 3. pending requests of the session below `max_session_pending_request`
//!
//! A limit of 0 disables its gate. Admitted requests hold an
//! `AdmissionGuard` until they finish; dropping it releases both pending
//! counts. Rejected requests are never queued.

use super::SessionId;
use crate::config::ServerSettings;
use crate::peer::ReturnCode;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MaxPendingRequest,
    MaxSessionRequestPerSecond,
    MaxSessionPendingRequest,
}

impl Rejection {
    /// Code carried by an operation response
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Rejection::MaxSessionRequestPerSecond => ReturnCode::MaxRequestPerSecond,
            Rejection::MaxPendingRequest | Rejection::MaxSessionPendingRequest => {
                ReturnCode::MaxPendingRequest
            }
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MaxPendingRequest => write!(f, "server pending request limit reached"),
            Rejection::MaxSessionRequestPerSecond => write!(f, "session request rate limit reached"),
            Rejection::MaxSessionPendingRequest => write!(f, "session pending request limit reached"),
        }
    }
}

/// Per-session counters
#[derive(Debug)]
struct SessionAmount {
    /// Start of the current window and requests seen in it
    window: Mutex<(Instant, usize)>,
    pending: AtomicUsize,
}

impl SessionAmount {
    fn new(now: Instant) -> Self {
        SessionAmount {
            window: Mutex::new((now, 0)),
            pending: AtomicUsize::new(0),
        }
    }

    /// Count one request; true if it fits in the window
    fn tick(&self, now: Instant, limit: usize) -> bool {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        if now.saturating_duration_since(window.0) >= WINDOW {
            *window = (now, 0);
        }
        window.1 += 1;
        limit == 0 || window.1 <= limit
    }
}

/// Backpressure gates of one server
#[derive(Debug)]
pub struct RequestAdmission {
    max_pending_request: usize,
    max_session_pending_request: usize,
    max_session_request_per_second: usize,
    pending: Arc<AtomicUsize>,
    sessions: DashMap<SessionId, Arc<SessionAmount>>,
}

/// Holds one admitted request's place in the pending counts
#[derive(Debug)]
pub struct AdmissionGuard {
    pending: Arc<AtomicUsize>,
    session: Arc<SessionAmount>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.session.pending.fetch_sub(1, Ordering::AcqRel);
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RequestAdmission {
    pub fn new(
        max_pending_request: usize,
        max_session_pending_request: usize,
        max_session_request_per_second: usize,
    ) -> Self {
        RequestAdmission {
            max_pending_request,
            max_session_pending_request,
            max_session_request_per_second,
            pending: Arc::new(AtomicUsize::new(0)),
            sessions: DashMap::new(),
        }
    }

    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self::new(
            settings.max_pending_request,
            settings.max_session_pending_request,
            settings.max_session_request_per_second,
        )
    }

    pub fn try_admit(&self, session: SessionId) -> Result<AdmissionGuard, Rejection> {
        self.try_admit_at(session, Instant::now())
    }

    /// Run the three gates as of `now`
    pub fn try_admit_at(&self, session: SessionId, now: Instant) -> Result<AdmissionGuard, Rejection> {
        let previous = self.pending.fetch_add(1, Ordering::AcqRel);
        if self.max_pending_request > 0 && previous >= self.max_pending_request {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(Rejection::MaxPendingRequest);
        }

        let amount = self
            .sessions
            .entry(session)
            .or_insert_with(|| Arc::new(SessionAmount::new(now)))
            .clone();

        if !amount.tick(now, self.max_session_request_per_second) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(Rejection::MaxSessionRequestPerSecond);
        }

        let previous = amount.pending.fetch_add(1, Ordering::AcqRel);
        if self.max_session_pending_request > 0 && previous >= self.max_session_pending_request {
            amount.pending.fetch_sub(1, Ordering::AcqRel);
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(Rejection::MaxSessionPendingRequest);
        }

        Ok(AdmissionGuard {
            pending: Arc::clone(&self.pending),
            session: amount,
        })
    }

    /// Forget a disconnected session; outstanding guards stay valid
    pub fn remove_session(&self, session: SessionId) {
        self.sessions.remove(&session);
    }

    pub fn pending_request(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn session_pending_request(&self, session: SessionId) -> usize {
        self.sessions
            .get(&session)
            .map(|amount| amount.pending.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Sessions with a live rate record
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: SessionId = SessionId(1);
    const B: SessionId = SessionId(2);

    #[test]
    fn test_rate_window_boundary() {
        let admission = RequestAdmission::new(0, 0, 3);
        let start = Instant::now();

        for _ in 0..3 {
            assert!(admission.try_admit_at(A, start).is_ok());
        }
        assert_eq!(
            admission.try_admit_at(A, start + Duration::from_millis(999)).unwrap_err(),
            Rejection::MaxSessionRequestPerSecond
        );
        // Other sessions have their own window
        assert!(admission.try_admit_at(B, start).is_ok());

        let next = start + Duration::from_secs(1);
        for _ in 0..3 {
            assert!(admission.try_admit_at(A, next).is_ok());
        }
        assert!(admission.try_admit_at(A, next).is_err());
        assert_eq!(admission.pending_request(), 0, "guards dropped immediately");
    }

    #[test]
    fn test_global_pending_ceiling() {
        let admission = RequestAdmission::new(2, 0, 0);
        let first = admission.try_admit(A).unwrap();
        let _second = admission.try_admit(B).unwrap();
        assert_eq!(admission.try_admit(A).unwrap_err(), Rejection::MaxPendingRequest);
        assert_eq!(admission.pending_request(), 2);

        drop(first);
        assert!(admission.try_admit(A).is_ok());
    }

    #[test]
    fn test_session_pending_ceiling() {
        let admission = RequestAdmission::new(0, 1, 0);
        let guard = admission.try_admit(A).unwrap();
        assert_eq!(admission.session_pending_request(A), 1);

        let rejection = admission.try_admit(A).unwrap_err();
        assert_eq!(rejection, Rejection::MaxSessionPendingRequest);
        assert_eq!(rejection.return_code(), ReturnCode::MaxPendingRequest);
        assert_eq!(admission.pending_request(), 1);
        assert!(admission.try_admit(B).is_ok());

        drop(guard);
        assert_eq!(admission.session_pending_request(A), 0);
        assert_eq!(admission.pending_request(), 0);
    }

    #[test]
    fn test_remove_session() {
        let admission = RequestAdmission::new(0, 0, 1);
        let guard = admission.try_admit(A).unwrap();
        assert_eq!(admission.session_count(), 1);

        admission.remove_session(A);
        assert_eq!(admission.session_count(), 0);
        drop(guard);
        assert_eq!(admission.pending_request(), 0);

        // A reconnecting session starts with a fresh window
        assert!(admission.try_admit(A).is_ok());
    }
}
