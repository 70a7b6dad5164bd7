//! Synchronized domain entities.

mod card;
mod expense;
mod settings;
mod trip;

pub use card::*;
pub use expense::*;
pub use settings::*;
pub use trip::*;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Collections that participate in sync. The serialized form is the
/// collection name used both locally and in remote document paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "trips")]
    Trip,
    #[serde(rename = "dashboards")]
    Dashboard,
    #[serde(rename = "groups")]
    Group,
    #[serde(rename = "cards")]
    Card,
    #[serde(rename = "expenses")]
    Expense,
    #[serde(rename = "settings")]
    Settings,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Trip,
        EntityKind::Dashboard,
        EntityKind::Group,
        EntityKind::Card,
        EntityKind::Expense,
        EntityKind::Settings,
    ];

    pub fn collection_name(&self) -> &'static str {
        match self {
            EntityKind::Trip => "trips",
            EntityKind::Dashboard => "dashboards",
            EntityKind::Group => "groups",
            EntityKind::Card => "cards",
            EntityKind::Expense => "expenses",
            EntityKind::Settings => "settings",
        }
    }

    pub fn from_collection_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.collection_name() == name)
    }

    /// Whether the device-local store keeps a collection for this kind.
    /// Groups and expenses only live in the collaborative trip tree.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            EntityKind::Trip | EntityKind::Dashboard | EntityKind::Card | EntityKind::Settings
        )
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.collection_name())
    }
}

/// Addresses one entity together with the parent ids needed to place it in
/// the trip tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub kind: EntityKind,
    pub id: String,
    pub trip_id: Option<String>,
    pub dashboard_id: Option<String>,
}

impl RecordKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            trip_id: None,
            dashboard_id: None,
        }
    }

    pub fn in_trip(mut self, trip_id: impl Into<String>) -> Self {
        self.trip_id = Some(trip_id.into());
        self
    }

    pub fn in_dashboard(mut self, dashboard_id: impl Into<String>) -> Self {
        self.dashboard_id = Some(dashboard_id.into());
        self
    }
}

/// Contract shared by every synchronized record.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn record_key(&self) -> RecordKey;
}

pub(crate) fn new_entity_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
