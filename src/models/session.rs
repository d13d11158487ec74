use crate::sync::{EntityKind, SyncEntity};
use crate::utils::{generate_id, now_millis};

use serde::{Deserialize, Serialize};

/// A viewing session on one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntity {
    pub id: String,
    pub owner_id: String,
    pub updated_at: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub device_name: String,
    #[serde(default)]
    pub layout_id: Option<String>,
    pub started_at: i64,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub picture_in_picture: bool,
    #[serde(default)]
    pub keep_awake: bool,
}

fn default_true() -> bool {
    true
}

impl SessionEntity {
    pub fn start(owner_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: generate_id(),
            owner_id: owner_id.into(),
            updated_at: now,
            is_active: true,
            device_name: device_name.into(),
            layout_id: None,
            started_at: now,
            ended_at: None,
            picture_in_picture: false,
            keep_awake: false,
        }
    }

    /// Mark the session finished at `at`
    pub fn end(&mut self, at: i64) {
        self.ended_at = Some(at);
        self.is_active = false;
    }
}

impl SyncEntity for SessionEntity {
    const KIND: EntityKind = EntityKind::Session;
    const LOCAL_FIELDS: &'static [&'static str] = &["pictureInPicture", "keepAwake"];

    fn id(&self) -> &str {
        &self.id
    }

    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn set_updated_at(&mut self, updated_at: i64) {
        self.updated_at = updated_at;
    }

    fn is_active(&self) -> bool {
        self.is_active
    }
}
