//! Client peer: request queues, timeouts and RTT
//!
//! `service()` is meant to be called from one application thread at a
//! steady tick. Everything else may be called from any thread. Each
//! collection has its own lock and `service()` works on snapshots, so a
//! callback may call back into the peer.

use super::codec::Message;
use super::pending::{OperationRequestPending, ResponseCallback};
use super::transport::PeerTransport;
use super::{
    Error, OperationEvent, OperationRequest, OperationResponse, Result, ReturnCode,
    SendParameters, PING_OPERATION_CODE,
};
use crate::config::ClientSettings;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Handler for server events
pub type EventHandler = Arc<dyn Fn(&OperationEvent) + Send + Sync>;

type Pending = Arc<OperationRequestPending>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client side of the operation protocol
pub struct ClientPeer<T: PeerTransport> {
    transport: T,
    settings: ClientSettings,
    update_interval: Duration,
    next_request_id: AtomicU16,

    waiting: Mutex<Vec<Pending>>,
    delayed: Mutex<VecDeque<Pending>>,
    immediate: Mutex<VecDeque<Pending>>,
    rtt_samples: Mutex<VecDeque<Duration>>,

    next_send_at: Mutex<Instant>,
    next_ping_at: Mutex<Option<Instant>>,
    event_handler: Mutex<Option<EventHandler>>,
}

impl<T: PeerTransport> ClientPeer<T> {
    pub fn new(transport: T, settings: ClientSettings) -> Self {
        let now = Instant::now();
        ClientPeer {
            update_interval: settings.update_interval(),
            next_ping_at: Mutex::new(settings.ping_interval().map(|_| now)),
            transport,
            settings,
            next_request_id: AtomicU16::new(0),
            waiting: Mutex::new(Vec::new()),
            delayed: Mutex::new(VecDeque::new()),
            immediate: Mutex::new(VecDeque::new()),
            rtt_samples: Mutex::new(VecDeque::new()),
            next_send_at: Mutex::new(now),
            event_handler: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub fn set_event_handler(&self, handler: impl Fn(&OperationEvent) + Send + Sync + 'static) {
        *lock(&self.event_handler) = Some(Arc::new(handler));
    }

    /// Queue a request; returns the request id assigned to it
    ///
    /// The callback runs on the thread calling `service()`, once, with
    /// either the server's response or a synthetic timeout.
    pub fn send(
        &self,
        request: OperationRequest,
        parameters: SendParameters,
        timeout: Option<Duration>,
        callback: impl FnOnce(&OperationResponse) + Send + 'static,
    ) -> Result<u16> {
        self.enqueue(request, parameters, timeout, Some(Box::new(callback)))
    }

    /// Queue a request and receive its response through a channel
    pub fn send_async(
        &self,
        request: OperationRequest,
        parameters: SendParameters,
        timeout: Option<Duration>,
    ) -> Result<Receiver<OperationResponse>> {
        let (tx, rx) = mpsc::channel();
        self.send(request, parameters, timeout, move |response| {
            let _ = tx.send(response.clone());
        })?;
        Ok(rx)
    }

    fn enqueue(
        &self,
        mut request: OperationRequest,
        parameters: SendParameters,
        timeout: Option<Duration>,
        callback: Option<ResponseCallback>,
    ) -> Result<u16> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        request.request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        request.encrypted = parameters.encrypted;
        let request_id = request.request_id;
        let timeout = timeout.unwrap_or_else(|| self.settings.default_timeout());
        let pending = Arc::new(OperationRequestPending::new(request, parameters, timeout, callback));

        if parameters.immediate {
            lock(&self.immediate).push_back(pending);
        } else {
            lock(&self.delayed).push_back(pending);
        }
        Ok(request_id)
    }

    /// Deliver a response from the server
    ///
    /// Returns false when no unresolved request carries its id.
    pub fn on_response(&self, response: OperationResponse) -> bool {
        let now = Instant::now();
        let pending = lock(&self.waiting)
            .iter()
            .find(|p| p.request_id() == response.request_id && !p.has_response())
            .cloned();

        match pending {
            Some(pending) => pending.resolve(response, now),
            None => {
                tracing::debug!(
                    request_id = response.request_id,
                    operation_code = response.operation_code,
                    "response without a pending request"
                );
                false
            }
        }
    }

    /// Deliver a server event to the handler
    pub fn on_event(&self, event: &OperationEvent) {
        let handler = lock(&self.event_handler).clone();
        match handler {
            Some(handler) => handler(event),
            None => tracing::trace!(event_code = event.event_code, "event without handler"),
        }
    }

    /// One tick of the pipeline
    ///
    /// Drains received messages, resolves timeouts, runs callbacks for
    /// resolved requests, then sends at most one request per update
    /// interval. Immediate requests go before any delayed one.
    pub fn service(&self) {
        let now = Instant::now();

        while let Some(message) = self.transport.try_receive() {
            match message {
                Message::Response(response) => {
                    self.on_response(response);
                }
                Message::Event(event) => self.on_event(&event),
                Message::Request(request) => tracing::warn!(
                    operation_code = request.operation_code,
                    "unexpected request from server"
                ),
            }
        }

        let waiting: Vec<Pending> = lock(&self.waiting).clone();

        for pending in &waiting {
            if pending.is_timed_out(now) {
                pending.fail(ReturnCode::OperationTimeout, "operation timed out", now);
                tracing::debug!(
                    request_id = pending.request_id(),
                    operation_code = pending.request().operation_code,
                    "operation timed out"
                );
            }
        }

        let mut done = Vec::new();
        for pending in waiting {
            if !pending.has_response() {
                continue;
            }
            if let Some(rtt) = pending.rtt() {
                self.add_rtt_sample(rtt);
            }
            pending.invoke();
            done.push(pending);
        }
        if !done.is_empty() {
            lock(&self.waiting).retain(|p| !done.iter().any(|d| Arc::ptr_eq(p, d)));
        }

        if !self.is_connected() {
            return;
        }

        self.send_ping_if_due(now);

        let due = {
            let mut next_send_at = lock(&self.next_send_at);
            if now >= *next_send_at {
                let mut next = lock(&self.immediate).pop_front();
                if next.is_none() {
                    next = lock(&self.delayed).pop_front();
                }
                if next.is_some() {
                    *next_send_at = now + self.update_interval;
                }
                next
            } else {
                None
            }
        };
        if let Some(pending) = due {
            self.transmit(pending, now);
        }
    }

    fn send_ping_if_due(&self, now: Instant) {
        let Some(interval) = self.settings.ping_interval() else {
            return;
        };
        {
            let mut next_ping_at = lock(&self.next_ping_at);
            match *next_ping_at {
                Some(at) if now >= at => *next_ping_at = Some(now + interval),
                _ => return,
            }
        }

        let mut request = OperationRequest::new(PING_OPERATION_CODE, Bytes::new());
        request.request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::new(OperationRequestPending::new(
            request,
            SendParameters::immediate(),
            self.settings.default_timeout(),
            None,
        ));
        self.transmit(pending, now);
    }

    /// Write one request and move it to the waiting list
    ///
    /// A transport failure resolves the request with `ReturnCode::Error`
    /// so its callback still runs on the next tick.
    fn transmit(&self, pending: Pending, now: Instant) {
        pending.mark_sent(now);
        let message = Message::Request(pending.request().clone());
        if let Err(e) = self.transport.send_message(&message) {
            tracing::warn!(
                request_id = pending.request_id(),
                error = %e,
                "failed to send operation request"
            );
            pending.fail(ReturnCode::Error, &e.to_string(), now);
        }
        lock(&self.waiting).push(pending);
    }

    fn add_rtt_sample(&self, rtt: Duration) {
        let mut samples = lock(&self.rtt_samples);
        samples.push_back(rtt);
        while samples.len() > self.settings.max_rtt_samples.max(1) {
            samples.pop_front();
        }
    }

    /// Moving average over the last `max_rtt_samples` round trips
    pub fn average_rtt(&self) -> Option<Duration> {
        let samples = lock(&self.rtt_samples);
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().sum();
        Some(total / samples.len() as u32)
    }

    /// Requests sent and not yet completed
    pub fn pending_count(&self) -> usize {
        lock(&self.waiting).len()
    }

    /// Requests not yet sent
    pub fn queued_count(&self) -> usize {
        lock(&self.delayed).len() + lock(&self.immediate).len()
    }
}
