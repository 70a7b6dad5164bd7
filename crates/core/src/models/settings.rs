use serde::{Deserialize, Serialize};

use super::{Entity, EntityKind, RecordKey};

/// Fixed id of the per-user settings singleton.
pub const ACCOUNT_SETTINGS_ID: &str = "account";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSettings {
    pub display_name: Option<String>,
    pub home_currency: Option<String>,
    pub locale: Option<String>,
    pub distance_unit: Option<String>,
}

impl Entity for AccountSettings {
    const KIND: EntityKind = EntityKind::Settings;

    fn id(&self) -> &str {
        ACCOUNT_SETTINGS_ID
    }

    fn record_key(&self) -> RecordKey {
        RecordKey::new(EntityKind::Settings, ACCOUNT_SETTINGS_ID)
    }
}
