//! Fire-and-forget event recording shared by all managers.

use std::sync::Arc;

use crate::batcher::Batcher;
use crate::storage::EventLog;
use crate::Event;

#[derive(Clone)]
struct Sink {
    batcher: Batcher,
    log: Arc<EventLog>,
}

/// Handle used by managers to append audit events.
///
/// Events are always emitted on the `audit` tracing target. When a log is
/// attached they are also queued for persistence; a full or closed queue
/// never surfaces to the caller.
#[derive(Clone)]
pub struct EventLogger {
    component: Arc<str>,
    sink: Option<Sink>,
}

impl EventLogger {
    /// Create a logger writing to `log`. Spawns the batcher, so a tokio
    /// runtime must be running.
    pub fn new(log: Arc<EventLog>, component: &str) -> Self {
        Self {
            component: Arc::from(component),
            sink: Some(Sink {
                batcher: Batcher::new(log.clone()),
                log,
            }),
        }
    }

    /// Create a logger that only traces (for testing)
    pub fn new_noop() -> Self {
        Self {
            component: Arc::from(""),
            sink: None,
        }
    }

    /// Same sink, different component label.
    pub fn for_component(&self, component: &str) -> Self {
        Self {
            component: Arc::from(component),
            sink: self.sink.clone(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn add_event(&self, object_id: &str, user_id: &str, action: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(
            target: "audit",
            component = %self.component,
            object_id,
            user_id,
            action,
            "{}",
            message
        );
        self.submit(object_id, user_id, action, message);
    }

    /// Record a failed action. Identical to [`add_event`](Self::add_event)
    /// except for the tracing level.
    pub fn add_failure(
        &self,
        object_id: &str,
        user_id: &str,
        action: &str,
        message: impl Into<String>,
    ) {
        let message = message.into();
        tracing::warn!(
            target: "audit",
            component = %self.component,
            object_id,
            user_id,
            action,
            "{}",
            message
        );
        self.submit(object_id, user_id, action, message);
    }

    fn submit(&self, object_id: &str, user_id: &str, action: &str, message: String) {
        if let Some(sink) = &self.sink {
            sink.batcher
                .submit(Event::new(&self.component, object_id, user_id, action, message));
        }
    }

    /// Persisted events for one object, oldest first.
    pub async fn events_for(&self, object_id: &str, limit: usize) -> anyhow::Result<Vec<Event>> {
        let Some(sink) = &self.sink else {
            return Ok(Vec::new());
        };
        let log = sink.log.clone();
        let object_id = object_id.to_string();
        tokio::task::spawn_blocking(move || log.query(Some(&object_id), limit)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn noop_logger_accepts_events() {
        let events = EventLogger::new_noop();
        events.add_event("vol-1", "u", "create_volume", "inserted");
        events.add_failure("vol-1", "u", "create_volume", "failed");
        assert!(events.events_for("vol-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn component_label_is_recorded() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(EventLog::open(dir.path()).unwrap());
        let events = EventLogger::new(log, "volume").for_component("vm");
        events.add_event("vm-1", "user-1", "start_vm", "started");

        let mut recorded = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            recorded = events.events_for("vm-1", 10).await.unwrap();
            if !recorded.is_empty() {
                break;
            }
        }
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].component, "vm");
        assert_eq!(recorded[0].user_id, "user-1");
        assert_eq!(recorded[0].action, "start_vm");
    }
}
