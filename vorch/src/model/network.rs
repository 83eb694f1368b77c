use serde::Serialize;
use uuid::Uuid;

use super::{Status, timestamp};

string_enum! {
    pub enum NetworkStatus {
        New => "new",
        Creating => "creating",
        Available => "available",
        Error => "error",
        Deleting => "deleting",
    }
}

impl Status for NetworkStatus {
    const ENTITY: &'static str = "network";

    fn as_str(&self) -> &'static str {
        NetworkStatus::as_str(self)
    }

    fn allows(self, next: Self) -> bool {
        use NetworkStatus::*;
        matches!(
            (self, next),
            (New, Creating)
                | (Creating, Available | Error)
                | (Available, Deleting)
                | (Deleting, Error)
                | (Error, Deleting)
        )
    }
}

string_enum! {
    /// Link state of the bridge
    pub enum NetworkState {
        On => "on",
        Off => "off",
    }
}

/// Virtual network record
#[derive(Debug, Clone, Serialize)]
pub struct VirtualNetwork {
    pub id: String,
    pub name: String,
    pub bridge: String,
    pub state: NetworkState,
    pub status: NetworkStatus,
    pub user_id: String,
    pub information: String,
    pub created_at: String,
    pub updated_at: String,
}

impl VirtualNetwork {
    pub fn new(name: String, bridge: String, user_id: String) -> Self {
        let now = timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            bridge,
            state: NetworkState::Off,
            status: NetworkStatus::New,
            user_id,
            information: String::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPatch {
    pub id: String,
    pub expected_status: NetworkStatus,
    pub state: NetworkState,
}
