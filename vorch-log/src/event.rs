use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// A single audit record.
///
/// `id` is a ULID, so ordering by id is ordering by time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub timestamp_ms: u64,
    pub component: String,
    pub object_id: String,
    pub user_id: String,
    pub action: String,
    pub message: String,
}

impl Event {
    pub fn new(
        component: &str,
        object_id: &str,
        user_id: &str,
        action: &str,
        message: impl Into<String>,
    ) -> Self {
        let ulid = Ulid::new();
        Self {
            id: ulid.to_string(),
            timestamp_ms: ulid.timestamp_ms(),
            component: component.to_string(),
            object_id: object_id.to_string(),
            user_id: user_id.to_string(),
            action: action.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_has_parseable_ulid() {
        let event = Event::new("volume", "vol-1", "user-1", "create_volume", "inserted");
        let ulid: Ulid = event.id.parse().unwrap();
        assert_eq!(ulid.timestamp_ms(), event.timestamp_ms);
        assert_eq!(event.action, "create_volume");
    }

    #[test]
    fn bincode_roundtrip() {
        let event = Event::new("vm", "vm-1", "user-1", "create_snapshot", "done");
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, event);
    }
}
