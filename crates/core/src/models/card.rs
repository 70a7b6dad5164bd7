use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{new_entity_id, Entity, EntityKind, RecordKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// An itinerary item on a dashboard.
///
/// `trip_id` is only set once the card lives in a shared trip tree; cards of
/// the single-user model are addressed by their dashboard alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    pub dashboard_id: String,
    pub trip_id: Option<String>,
    pub group_id: Option<String>,
    pub title: String,
    pub notes: Option<String>,
    pub location: Option<Location>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub cost: Option<Decimal>,
    #[serde(default)]
    pub position: i32,
}

impl Card {
    pub fn new(dashboard_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: new_entity_id(),
            dashboard_id: dashboard_id.into(),
            trip_id: None,
            group_id: None,
            title: title.into(),
            notes: None,
            location: None,
            starts_at: None,
            ends_at: None,
            cost: None,
            position: 0,
        }
    }
}

impl Entity for Card {
    const KIND: EntityKind = EntityKind::Card;

    fn id(&self) -> &str {
        &self.id
    }

    fn record_key(&self) -> RecordKey {
        let key = RecordKey::new(EntityKind::Card, &self.id).in_dashboard(&self.dashboard_id);
        match &self.trip_id {
            Some(trip_id) => key.in_trip(trip_id),
            None => key,
        }
    }
}
