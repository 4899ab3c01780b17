//! Wrapper over the injected [`NotificationCenter`].
//!
//! Every schedule or cancel is announced as [`ReminderEvent::RemindersChanged`]
//! on the reminder event bus. Nothing else couples notification state to the
//! merge engine.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use chronitol_core::{Clock, EventBus, NotificationError, ReminderEvent};

use super::{
    delayed_identifier, DeliveredNotification, NotificationCenter, NotificationContent, NotificationRequest,
    NotificationResponse, Trigger,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Authorization {
    Unknown,
    Granted,
    Denied,
}

pub struct NotificationAdapter {
    center: Arc<dyn NotificationCenter>,
    clock: Arc<dyn Clock>,
    events: EventBus<ReminderEvent>,
    authorization: Mutex<Authorization>,
    /// When each request's current cycle began: last armed or resolved.
    cycles: Mutex<HashMap<String, DateTime<Utc>>>,
    actions_tx: mpsc::UnboundedSender<NotificationResponse>,
    actions_rx: Mutex<Option<mpsc::UnboundedReceiver<NotificationResponse>>>,
}

impl NotificationAdapter {
    pub fn new(center: Arc<dyn NotificationCenter>, clock: Arc<dyn Clock>) -> Self {
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        Self {
            center,
            clock,
            events: EventBus::new(EVENT_CHANNEL_CAPACITY),
            authorization: Mutex::new(Authorization::Unknown),
            cycles: Mutex::new(HashMap::new()),
            actions_tx,
            actions_rx: Mutex::new(Some(actions_rx)),
        }
    }

    pub fn events(&self) -> &EventBus<ReminderEvent> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReminderEvent> {
        self.events.subscribe()
    }

    /// Ask once; the answer is remembered. A denial is logged a single time.
    pub async fn ensure_authorized(&self) -> bool {
        match *self.authorization.lock() {
            Authorization::Granted => return true,
            Authorization::Denied => return false,
            Authorization::Unknown => {}
        }

        let granted = match self.center.request_authorization().await {
            Ok(granted) => granted,
            Err(error) => {
                warn!(%error, "notification authorization request failed");
                false
            }
        };

        let mut state = self.authorization.lock();
        if *state == Authorization::Unknown {
            *state = if granted {
                info!("notification authorization granted");
                Authorization::Granted
            } else {
                warn!("notification authorization denied; reminders will not be scheduled");
                Authorization::Denied
            };
        }
        *state == Authorization::Granted
    }

    /// Schedule (or replace) a request that fires every day at `hour:minute`.
    pub async fn schedule_recurring_daily(
        &self,
        hour: u8,
        minute: u8,
        id: &str,
        content: NotificationContent,
    ) -> Result<(), NotificationError> {
        let request = NotificationRequest {
            id: id.to_string(),
            content,
            trigger: Trigger::Daily { hour, minute },
        };
        self.add(request).await
    }

    /// Schedule a one-shot request `after` from now. Returns the identifier
    /// used, which is always `<base>:delayed`.
    pub async fn schedule_one_shot(
        &self,
        after: Duration,
        base_id: &str,
        content: NotificationContent,
    ) -> Result<String, NotificationError> {
        let id = delayed_identifier(base_id);
        let request = NotificationRequest {
            id: id.clone(),
            content,
            trigger: Trigger::Interval {
                seconds: after.num_seconds().max(1) as u64,
                armed_at: self.clock.now(),
            },
        };
        self.add(request).await?;
        Ok(id)
    }

    async fn add(&self, request: NotificationRequest) -> Result<(), NotificationError> {
        if !self.ensure_authorized().await {
            debug!(id = %request.id, "not authorized, request dropped");
            return Err(NotificationError::AuthorizationDenied);
        }

        let id = request.id.clone();
        let trigger = request.trigger.to_string();
        let title = request.content.title.clone();
        let body = request.content.body.clone();
        match self.center.add(request).await {
            Ok(()) => {
                debug!(%id, %trigger, "notification scheduled");
                let _ = self.cycles.lock().insert(id, self.clock.now());
                let _ = self.events.publish(ReminderEvent::RemindersChanged);
                Ok(())
            }
            Err(error) => {
                warn!(%id, %title, %body, %trigger, %error, "failed to schedule notification");
                Err(error)
            }
        }
    }

    /// Remove a request from both the pending and delivered lists.
    pub async fn cancel(&self, id: &str) {
        let ids = [id.to_string()];
        self.center.remove_pending(&ids).await;
        self.center.remove_delivered(&ids).await;
        let _ = self.cycles.lock().remove(id);
        debug!(%id, "notification cancelled");
        let _ = self.events.publish(ReminderEvent::RemindersChanged);
    }

    /// Clear a delivered notification, leaving any pending request with the
    /// same identifier armed.
    pub async fn resolve_delivered(&self, id: &str) {
        self.center.remove_delivered(&[id.to_string()]).await;
        let _ = self.cycles.lock().insert(id.to_string(), self.clock.now());
        debug!(%id, "delivered notification resolved");
        let _ = self.events.publish(ReminderEvent::RemindersChanged);
    }

    pub async fn cancel_all(&self) {
        self.center.remove_all_pending().await;
        self.center.remove_all_delivered().await;
        self.cycles.lock().clear();
        info!("all notifications cancelled");
        let _ = self.events.publish(ReminderEvent::RemindersChanged);
    }

    /// Start of the request's current cycle. Occurrences at or before it
    /// have been answered or predate the request.
    pub fn cycle_start(&self, id: &str) -> Option<DateTime<Utc>> {
        self.cycles.lock().get(id).copied()
    }

    pub async fn list_pending(&self) -> Vec<NotificationRequest> {
        self.center.pending().await
    }

    pub async fn list_delivered(&self) -> Vec<DeliveredNotification> {
        self.center.delivered().await
    }

    /// Feed a user response into the action stream.
    pub fn submit_action(&self, response: NotificationResponse) {
        if self.actions_tx.send(response).is_err() {
            warn!("action stream closed, response dropped");
        }
    }

    /// The receiving half of the action stream. Available once.
    pub fn take_action_stream(&self) -> Option<mpsc::UnboundedReceiver<NotificationResponse>> {
        self.actions_rx.lock().take()
    }
}
