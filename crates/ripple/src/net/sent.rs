use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use super::protocol::{Guarantee, Response};

type Callback = Box<dyn FnOnce(bool, &SentThing) + Send>;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Completion handle for a tracked outbound packet. Shared between the
/// connection's waiting list and whoever sent it.
pub struct SentThing {
    packet_number: u32,
    guarantee: Guarantee,
    is_request: bool,
    payload: Vec<u8>,
    attempts: AtomicU32,
    sent_at: Mutex<Instant>,
    confirmed_at: Mutex<Option<Instant>>,
    delivered_at: Mutex<Option<Instant>>,
    timed: AtomicBool,
    finalizing: AtomicBool,
    done: AtomicBool,
    succeeded: AtomicBool,
    response: Mutex<Option<Response>>,
    callback: Mutex<Option<Callback>>,
    notify: Notify,
}

impl SentThing {
    pub fn new(packet_number: u32, guarantee: Guarantee, is_request: bool, payload: Vec<u8>) -> Self {
        Self {
            packet_number,
            guarantee,
            is_request,
            payload,
            attempts: AtomicU32::new(1),
            sent_at: Mutex::new(Instant::now()),
            confirmed_at: Mutex::new(None),
            delivered_at: Mutex::new(None),
            timed: AtomicBool::new(false),
            finalizing: AtomicBool::new(false),
            done: AtomicBool::new(false),
            succeeded: AtomicBool::new(false),
            response: Mutex::new(None),
            callback: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn packet_number(&self) -> u32 {
        self.packet_number
    }

    pub fn guarantee(&self) -> Guarantee {
        self.guarantee
    }

    pub fn is_request(&self) -> bool {
        self.is_request
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Bumps the attempt counter and returns the new value.
    pub(crate) fn next_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn sent_at(&self) -> Instant {
        *self.sent_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn reset_sent_at(&self, now: Instant) {
        *self.sent_at.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn confirmed_at(&self) -> Option<Instant> {
        *self.confirmed_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// When the remote acknowledged the packet itself. Only tracked for
    /// requests, which stay pending until their response.
    pub fn delivered_at(&self) -> Option<Instant> {
        *self.delivered_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn mark_delivered(&self, now: Instant) {
        self.delivered_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert(now);
    }

    pub fn set_timed(&self, timed: bool) {
        self.timed.store(timed, Ordering::Release);
    }

    pub fn is_timed(&self) -> bool {
        self.timed.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn succeeded(&self) -> bool {
        self.is_done() && self.succeeded.load(Ordering::Acquire)
    }

    /// Time between the last transmission and confirmation.
    pub fn round_trip(&self) -> Option<Duration> {
        self.confirmed_at()
            .map(|confirmed| confirmed.saturating_duration_since(self.sent_at()))
    }

    /// The response matched to this request, if any arrived.
    pub fn response(&self) -> Option<Response> {
        self.response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_response(&self, response: Response) {
        *self.response.lock().unwrap_or_else(|e| e.into_inner()) = Some(response);
    }

    /// Runs `callback` once the packet is finalized. Runs it immediately if
    /// that already happened.
    pub fn set_callback(&self, callback: impl FnOnce(bool, &SentThing) + Send + 'static) {
        let mut slot = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_done() {
            drop(slot);
            callback(self.succeeded(), self);
            return;
        }
        *slot = Some(Box::new(callback));
    }

    /// Marks the packet finished. Only the first call has any effect; returns
    /// whether this call was it.
    pub fn on_finalized(&self, succeeded: bool) -> bool {
        if self.finalizing.swap(true, Ordering::AcqRel) {
            return false;
        }

        if succeeded {
            let mut confirmed = self.confirmed_at.lock().unwrap_or_else(|e| e.into_inner());
            confirmed.get_or_insert_with(Instant::now);
        }

        self.succeeded.store(succeeded, Ordering::Release);

        let callback = {
            let mut slot = self.callback.lock().unwrap_or_else(|e| e.into_inner());
            self.done.store(true, Ordering::Release);
            slot.take()
        };

        self.notify.notify_waiters();

        if let Some(callback) = callback {
            callback(succeeded, self);
        }
        true
    }

    /// Blocks the calling thread until finalized. Not for use on async tasks.
    pub fn wait_blocking(&self) -> bool {
        while !self.is_done() {
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
        self.succeeded()
    }

    pub async fn finished(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_done() {
                return self.succeeded();
            }
            notified.await;
        }
    }
}

impl fmt::Debug for SentThing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentThing")
            .field("packet_number", &self.packet_number)
            .field("guarantee", &self.guarantee)
            .field("is_request", &self.is_request)
            .field("attempts", &self.attempts())
            .field("done", &self.is_done())
            .field("succeeded", &self.succeeded())
            .finish()
    }
}
