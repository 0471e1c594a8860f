//! In-flight request bookkeeping

use super::{OperationRequest, OperationResponse, ReturnCode, SendParameters};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// Invoked once with the response, real or synthetic
pub type ResponseCallback = Box<dyn FnOnce(&OperationResponse) + Send>;

#[derive(Debug)]
struct Resolution {
    response: OperationResponse,
    received_at: Instant,
    synthetic: bool,
}

/// One request from enqueue until its callback has run
///
/// The response slot is written at most once, by whichever comes first:
/// the receiving side or the timeout scan.
pub struct OperationRequestPending {
    request: OperationRequest,
    parameters: SendParameters,
    timeout: Duration,
    callback: Mutex<Option<ResponseCallback>>,
    sent_at: OnceLock<Instant>,
    resolution: OnceLock<Resolution>,
}

impl OperationRequestPending {
    pub fn new(
        request: OperationRequest,
        parameters: SendParameters,
        timeout: Duration,
        callback: Option<ResponseCallback>,
    ) -> Self {
        OperationRequestPending {
            request,
            parameters,
            timeout,
            callback: Mutex::new(callback),
            sent_at: OnceLock::new(),
            resolution: OnceLock::new(),
        }
    }

    pub fn request(&self) -> &OperationRequest {
        &self.request
    }

    pub fn request_id(&self) -> u16 {
        self.request.request_id
    }

    pub fn parameters(&self) -> SendParameters {
        self.parameters
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn mark_sent(&self, now: Instant) {
        let _ = self.sent_at.set(now);
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at.get().copied()
    }

    /// Sent, unanswered, and at least `timeout` old
    pub fn is_timed_out(&self, now: Instant) -> bool {
        if self.has_response() {
            return false;
        }
        self.sent_at()
            .is_some_and(|sent| now.saturating_duration_since(sent) >= self.timeout)
    }

    /// Store the peer's response; false if already resolved
    pub fn resolve(&self, response: OperationResponse, now: Instant) -> bool {
        self.resolution
            .set(Resolution {
                response,
                received_at: now,
                synthetic: false,
            })
            .is_ok()
    }

    /// Resolve locally with `return_code`; false if already resolved
    pub fn fail(&self, return_code: ReturnCode, message: &str, now: Instant) -> bool {
        let response = OperationResponse::for_request(&self.request, return_code)
            .with_debug_message(message);
        self.resolution
            .set(Resolution {
                response,
                received_at: now,
                synthetic: true,
            })
            .is_ok()
    }

    pub fn has_response(&self) -> bool {
        self.resolution.get().is_some()
    }

    pub fn response(&self) -> Option<&OperationResponse> {
        self.resolution.get().map(|r| &r.response)
    }

    /// Round trip of a real response
    pub fn rtt(&self) -> Option<Duration> {
        let resolution = self.resolution.get().filter(|r| !r.synthetic)?;
        let sent = self.sent_at()?;
        Some(resolution.received_at.saturating_duration_since(sent))
    }

    /// Run the callback once; a panic inside it is caught and logged
    pub fn invoke(&self) {
        let Some(response) = self.response() else {
            return;
        };
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(response))).is_err() {
                tracing::error!(
                    operation_code = self.request.operation_code,
                    request_id = self.request.request_id,
                    "response callback panicked"
                );
            }
        }
    }
}

impl std::fmt::Debug for OperationRequestPending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRequestPending")
            .field("request", &self.request)
            .field("parameters", &self.parameters)
            .field("timeout", &self.timeout)
            .field("sent_at", &self.sent_at())
            .field("resolved", &self.has_response())
            .finish()
    }
}
