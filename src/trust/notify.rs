use super::TrustLevel;
use crate::shared::ids::UserId;
use crate::shared::logging::EventLog;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustNotification {
    pub user_id: UserId,
    pub old_level: TrustLevel,
    pub new_level: TrustLevel,
    pub trigger_event: String,
    pub timestamp: i64,
}

/// Delivery seam for level-change events.
pub trait TrustNotifier: Send + Sync {
    fn notify(&self, notification: &TrustNotification);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl TrustNotifier for NoopNotifier {
    fn notify(&self, _notification: &TrustNotification) {}
}

#[derive(Debug, Default)]
pub struct MemoryNotifier {
    delivered: Mutex<Vec<TrustNotification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<TrustNotification> {
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl TrustNotifier for MemoryNotifier {
    fn notify(&self, notification: &TrustNotification) {
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification.clone());
    }
}

/// Writes each level change to the orchestrator event log.
#[derive(Debug, Clone)]
pub struct EventLogNotifier {
    log: Arc<EventLog>,
}

impl EventLogNotifier {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }
}

impl TrustNotifier for EventLogNotifier {
    fn notify(&self, notification: &TrustNotification) {
        self.log.record(
            notification.timestamp,
            "trust_notification",
            &[
                ("userId", Value::String(notification.user_id.to_string())),
                ("oldLevel", Value::String(notification.old_level.to_string())),
                ("newLevel", Value::String(notification.new_level.to_string())),
                (
                    "triggerEvent",
                    Value::String(notification.trigger_event.clone()),
                ),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::TrustLevel;
    use tempfile::tempdir;

    #[test]
    fn event_log_notifier_appends_one_line_per_change() {
        let temp = tempdir().expect("temp dir");
        let log = Arc::new(EventLog::for_state_root(temp.path()));
        let notifier = EventLogNotifier::new(log.clone());
        notifier.notify(&TrustNotification {
            user_id: UserId::parse("analyst-1").expect("user"),
            old_level: TrustLevel::Observational,
            new_level: TrustLevel::Suggestive,
            trigger_event: "assessment".to_string(),
            timestamp: 42,
        });

        let events = log.read_events().expect("read events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "trust_notification");
        assert_eq!(events[0]["newLevel"], "suggestive");
        assert_eq!(events[0]["timestamp"], 42);
    }
}
