use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{new_entity_id, Entity, EntityKind, RecordKey};

/// Top-level shared document. `collaborators` and `editors` are denormalized
/// email lists so "trips shared with me" is a single array-contains query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    #[serde(default)]
    pub collaborators: Vec<String>,
    /// Subset of `collaborators` allowed to edit.
    #[serde(default)]
    pub editors: Vec<String>,
    pub destination: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Trip {
    pub fn new(name: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: new_entity_id(),
            name: name.into(),
            owner_id: owner_id.into(),
            collaborators: Vec::new(),
            editors: Vec::new(),
            destination: None,
            start_date: None,
            end_date: None,
            currency: None,
            updated_at: None,
        }
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    pub fn can_edit(&self, user_id: &str, email: &str) -> bool {
        self.is_owned_by(user_id) || self.editors.iter().any(|e| e.eq_ignore_ascii_case(email))
    }

    /// Adds or updates a collaborator. Returns false if nothing changed.
    pub fn share_with(&mut self, email: &str, can_edit: bool) -> bool {
        let email = email.trim().to_lowercase();
        let mut changed = false;
        if !self.collaborators.contains(&email) {
            self.collaborators.push(email.clone());
            changed = true;
        }
        let is_editor = self.editors.contains(&email);
        if can_edit && !is_editor {
            self.editors.push(email);
            changed = true;
        } else if !can_edit && is_editor {
            self.editors.retain(|e| *e != email);
            changed = true;
        }
        changed
    }

    /// Removes a collaborator and their edit permission.
    pub fn unshare_with(&mut self, email: &str) -> bool {
        let email = email.trim().to_lowercase();
        let before = self.collaborators.len() + self.editors.len();
        self.collaborators.retain(|e| *e != email);
        self.editors.retain(|e| *e != email);
        before != self.collaborators.len() + self.editors.len()
    }
}

impl Entity for Trip {
    const KIND: EntityKind = EntityKind::Trip;

    fn id(&self) -> &str {
        &self.id
    }

    fn record_key(&self) -> RecordKey {
        RecordKey::new(EntityKind::Trip, &self.id).in_trip(&self.id)
    }
}

/// A board inside a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub id: String,
    pub trip_id: String,
    pub name: String,
    #[serde(default)]
    pub position: i32,
    pub color: Option<String>,
}

impl Dashboard {
    pub fn new(trip_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: new_entity_id(),
            trip_id: trip_id.into(),
            name: name.into(),
            position: 0,
            color: None,
        }
    }
}

impl Entity for Dashboard {
    const KIND: EntityKind = EntityKind::Dashboard;

    fn id(&self) -> &str {
        &self.id
    }

    fn record_key(&self) -> RecordKey {
        RecordKey::new(EntityKind::Dashboard, &self.id)
            .in_trip(&self.trip_id)
            .in_dashboard(&self.id)
    }
}

/// A column of cards on a dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub trip_id: String,
    pub dashboard_id: String,
    pub name: String,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub card_ids: Vec<String>,
    #[serde(default)]
    pub collapsed: bool,
}

impl Group {
    pub fn new(
        trip_id: impl Into<String>,
        dashboard_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: new_entity_id(),
            trip_id: trip_id.into(),
            dashboard_id: dashboard_id.into(),
            name: name.into(),
            position: 0,
            card_ids: Vec::new(),
            collapsed: false,
        }
    }
}

impl Entity for Group {
    const KIND: EntityKind = EntityKind::Group;

    fn id(&self) -> &str {
        &self.id
    }

    fn record_key(&self) -> RecordKey {
        RecordKey::new(EntityKind::Group, &self.id)
            .in_trip(&self.trip_id)
            .in_dashboard(&self.dashboard_id)
    }
}
