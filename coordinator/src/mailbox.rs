// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Single-slot request mailbox
//!
//! Holds the one screenshot request that may be in flight system-wide. The
//! publisher keeps a [`RequestHandle`] and blocks on it; sessions claim the
//! request (at most one session ever owns it) and complete it. Only the
//! publisher clears the slot, either after reading the outcome or when its
//! deadline expires.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, warn};
use shutter_protocol::ScreenshotRequest;

use crate::{CoordinatorError, RequestFailure, Result};

/// Result recorded by whoever served the request
pub type Outcome = std::result::Result<(), RequestFailure>;

/// Identifies one published request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Pending {
    id: RequestId,
    request: Arc<ScreenshotRequest>,
    claimed: bool,
    outcome: Option<Outcome>,
}

impl Pending {
    fn is_claimable(&self) -> bool {
        !self.claimed && self.outcome.is_none()
    }
}

#[derive(Default)]
struct Slot {
    next_id: u64,
    pending: Option<Pending>,
    closed: bool,
}

impl Slot {
    fn has_work(&self) -> bool {
        self.pending.as_ref().is_some_and(Pending::is_claimable)
    }
}

/// Mailbox shared between publishers and sessions
#[derive(Default)]
pub struct Mailbox {
    slot: Mutex<Slot>,
    changed: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_on<'a>(
        &self,
        guard: MutexGuard<'a, Slot>,
        deadline: Option<Instant>,
    ) -> MutexGuard<'a, Slot> {
        match deadline {
            None => self.changed.wait(guard).unwrap_or_else(PoisonError::into_inner),
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                self.changed
                    .wait_timeout(guard, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        }
    }

    fn admit(&self, slot: &mut Slot, request: ScreenshotRequest) -> RequestId {
        slot.next_id += 1;
        let id = RequestId(slot.next_id);
        debug!("Published request {id}: {request:?}");
        slot.pending = Some(Pending {
            id,
            request: Arc::new(request),
            claimed: false,
            outcome: None,
        });
        self.changed.notify_all();
        id
    }

    /// Publish without waiting; fails with `Busy` if a request is pending.
    pub fn try_publish(&self, request: ScreenshotRequest) -> Result<RequestHandle<'_>> {
        let mut slot = self.lock();
        if slot.closed {
            return Err(RequestFailure::Shutdown.into());
        }
        if slot.pending.is_some() {
            return Err(CoordinatorError::Busy);
        }

        let id = self.admit(&mut slot, request);
        Ok(RequestHandle { mailbox: self, id })
    }

    /// Publish, waiting until `deadline` for a pending request to clear.
    pub fn publish(
        &self,
        request: ScreenshotRequest,
        deadline: Option<Instant>,
    ) -> Result<RequestHandle<'_>> {
        let mut slot = self.lock();
        loop {
            if slot.closed {
                return Err(RequestFailure::Shutdown.into());
            }
            if slot.pending.is_none() {
                let id = self.admit(&mut slot, request);
                return Ok(RequestHandle { mailbox: self, id });
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(CoordinatorError::Timeout);
            }
            slot = self.wait_on(slot, deadline);
        }
    }

    /// Peek at the pending request without taking ownership of it.
    pub fn take(&self) -> Option<(RequestId, Arc<ScreenshotRequest>)> {
        let slot = self.lock();
        slot.pending
            .as_ref()
            .filter(|pending| pending.outcome.is_none())
            .map(|pending| (pending.id, Arc::clone(&pending.request)))
    }

    /// Take ownership of the pending request. Each request is handed to at
    /// most one caller.
    pub fn claim(&self) -> Option<(RequestId, Arc<ScreenshotRequest>)> {
        let mut slot = self.lock();
        let pending = slot.pending.as_mut().filter(|pending| pending.is_claimable())?;
        pending.claimed = true;
        debug!("Claimed request {}", pending.id);
        Some((pending.id, Arc::clone(&pending.request)))
    }

    /// Sleep until a claimable request shows up or `timeout` elapses.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let slot = self.lock();
        if slot.has_work() {
            return true;
        }
        let slot = self.wait_on(slot, Some(Instant::now() + timeout));
        slot.has_work()
    }

    /// Record the outcome of request `id` and wake its publisher.
    ///
    /// Idempotent: the first outcome wins, and outcomes for requests that are
    /// no longer in the slot are ignored. Returns whether this call recorded
    /// the outcome.
    pub fn complete(&self, id: RequestId, outcome: Outcome) -> bool {
        let mut slot = self.lock();
        match slot.pending.as_mut() {
            Some(pending) if pending.id == id && pending.outcome.is_none() => {
                debug!("Completed request {id}: {outcome:?}");
                pending.outcome = Some(outcome);
                self.changed.notify_all();
                true
            }
            _ => {
                debug!("Ignoring completion of stale request {id}");
                false
            }
        }
    }

    /// True while a request occupies the slot.
    pub fn is_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Refuse new requests and fail the pending one unless a session already
    /// owns it; a claimed request is left to finish.
    pub fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        if let Some(pending) = slot.pending.as_mut().filter(|pending| pending.is_claimable()) {
            pending.outcome = Some(Err(RequestFailure::Shutdown));
        }
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn finish(&self, id: RequestId, deadline: Option<Instant>) -> Result<()> {
        let mut slot = self.lock();
        loop {
            let outcome = match slot.pending.as_mut() {
                Some(pending) if pending.id == id => pending.outcome.take(),
                _ => return Err(CoordinatorError::Timeout),
            };

            if let Some(outcome) = outcome {
                slot.pending = None;
                self.changed.notify_all();
                return outcome.map_err(CoordinatorError::from);
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("Request {id} timed out; clearing mailbox");
                slot.pending = None;
                self.changed.notify_all();
                return Err(CoordinatorError::Timeout);
            }

            slot = self.wait_on(slot, deadline);
        }
    }

    fn abandon(&self, id: RequestId) {
        let mut slot = self.lock();
        if slot.pending.as_ref().is_some_and(|pending| pending.id == id) {
            debug!("Request {id} abandoned by its publisher");
            slot.pending = None;
            self.changed.notify_all();
        }
    }
}

/// Publisher's side of a pending request
///
/// Dropping the handle without waiting frees the slot.
#[must_use = "a published request occupies the mailbox until waited on"]
pub struct RequestHandle<'a> {
    mailbox: &'a Mailbox,
    id: RequestId,
}

impl RequestHandle<'_> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Block until the request is completed or `deadline` passes. On expiry
    /// the slot is force-cleared and `Timeout` is returned.
    pub fn wait(self, deadline: Option<Instant>) -> Result<()> {
        self.mailbox.finish(self.id, deadline)
    }
}

impl Drop for RequestHandle<'_> {
    fn drop(&mut self) {
        self.mailbox.abandon(self.id);
    }
}
