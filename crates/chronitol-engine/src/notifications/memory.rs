//! Simulated notification center driven by the injected clock.
//!
//! Backs the CLI and the tests in place of a platform service.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use chronitol_core::{Calendar, Clock, NotificationError};

use super::{DeliveredNotification, NotificationCenter, NotificationRequest, Trigger};

struct PendingSlot {
    request: NotificationRequest,
    fire_at: DateTime<Utc>,
}

#[derive(Default)]
struct CenterState {
    pending: Vec<PendingSlot>,
    delivered: Vec<DeliveredNotification>,
}

/// Process-local stand-in for the OS notification service.
///
/// Requests fire when [`deliver_due`](Self::deliver_due) is called at or
/// after their trigger time. Authorization and add failures can be forced.
pub struct InMemoryNotificationCenter {
    calendar: Calendar,
    clock: Arc<dyn Clock>,
    state: Mutex<CenterState>,
    authorized: AtomicBool,
    fail_adds: AtomicBool,
    add_calls: AtomicUsize,
}

impl InMemoryNotificationCenter {
    pub fn new(calendar: Calendar, clock: Arc<dyn Clock>) -> Self {
        Self {
            calendar,
            clock,
            state: Mutex::new(CenterState::default()),
            authorized: AtomicBool::new(true),
            fail_adds: AtomicBool::new(false),
            add_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }

    /// Make every subsequent `add` fail.
    pub fn set_fail_adds(&self, fail: bool) {
        self.fail_adds.store(fail, Ordering::SeqCst);
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.state.lock().pending.iter().map(|s| s.request.id.clone()).collect()
    }

    pub fn delivered_ids(&self) -> Vec<String> {
        self.state.lock().delivered.iter().map(|d| d.request.id.clone()).collect()
    }

    pub fn pending_request(&self, id: &str) -> Option<NotificationRequest> {
        self.state
            .lock()
            .pending
            .iter()
            .find(|s| s.request.id == id)
            .map(|s| s.request.clone())
    }

    /// Fire every pending request whose time has come. Daily requests stay
    /// pending for their next occurrence; one-shots are consumed.
    pub fn deliver_due(&self) -> Vec<DeliveredNotification> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut fired = Vec::new();

        let mut remaining = Vec::with_capacity(state.pending.len());
        for mut slot in std::mem::take(&mut state.pending) {
            if slot.fire_at > now {
                remaining.push(slot);
                continue;
            }
            fired.push(DeliveredNotification {
                request: slot.request.clone(),
                delivered_at: slot.fire_at,
            });
            if let Trigger::Daily { hour, minute } = slot.request.trigger {
                slot.fire_at = self.calendar.next_occurrence(hour, minute, now);
                remaining.push(slot);
            }
        }
        state.pending = remaining;

        for delivered in &fired {
            state.delivered.retain(|d| d.request.id != delivered.request.id);
            state.delivered.push(delivered.clone());
        }
        fired
    }

    /// Deliver one pending request immediately, regardless of its trigger time.
    pub fn deliver_now(&self, id: &str) -> Option<DeliveredNotification> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let idx = state.pending.iter().position(|s| s.request.id == id)?;

        let request = state.pending[idx].request.clone();
        match request.trigger {
            Trigger::Daily { hour, minute } => {
                state.pending[idx].fire_at = self.calendar.next_occurrence(hour, minute, now);
            }
            Trigger::Interval { .. } => {
                let _ = state.pending.remove(idx);
            }
        }

        let delivered = DeliveredNotification {
            request,
            delivered_at: now,
        };
        state.delivered.retain(|d| d.request.id != id);
        state.delivered.push(delivered.clone());
        Some(delivered)
    }
}

#[async_trait]
impl NotificationCenter for InMemoryNotificationCenter {
    async fn request_authorization(&self) -> Result<bool, NotificationError> {
        Ok(self.authorized.load(Ordering::SeqCst))
    }

    async fn add(&self, request: NotificationRequest) -> Result<(), NotificationError> {
        let _ = self.add_calls.fetch_add(1, Ordering::SeqCst);
        if !self.authorized.load(Ordering::SeqCst) {
            return Err(NotificationError::AuthorizationDenied);
        }
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(NotificationError::AddFailed {
                id: request.id,
                reason: "simulated failure".into(),
            });
        }

        let fire_at = request.trigger.next_fire(self.clock.now(), &self.calendar);
        let mut state = self.state.lock();
        match state.pending.iter_mut().find(|s| s.request.id == request.id) {
            Some(slot) => {
                slot.request = request;
                slot.fire_at = fire_at;
            }
            None => state.pending.push(PendingSlot { request, fire_at }),
        }
        Ok(())
    }

    async fn remove_pending(&self, ids: &[String]) {
        self.state.lock().pending.retain(|s| !ids.contains(&s.request.id));
    }

    async fn remove_delivered(&self, ids: &[String]) {
        self.state.lock().delivered.retain(|d| !ids.contains(&d.request.id));
    }

    async fn remove_all_pending(&self) {
        self.state.lock().pending.clear();
    }

    async fn remove_all_delivered(&self) {
        self.state.lock().delivered.clear();
    }

    async fn pending(&self) -> Vec<NotificationRequest> {
        self.state.lock().pending.iter().map(|s| s.request.clone()).collect()
    }

    async fn delivered(&self) -> Vec<DeliveredNotification> {
        self.state.lock().delivered.clone()
    }
}
