use crate::sync::{EntityKind, SyncEntity};
use crate::utils::{generate_id, now_millis};

use serde::{Deserialize, Serialize};

/// A multi-view grid arrangement of streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutEntity {
    pub id: String,
    pub owner_id: String,
    pub updated_at: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub name: String,
    #[serde(default)]
    pub stream_ids: Vec<String>,
    pub columns: u8,
    pub rows: u8,
    /// Stream shown enlarged on this device.
    #[serde(default)]
    pub focused_stream_id: Option<String>,
    /// Stream whose audio plays on this device.
    #[serde(default)]
    pub audio_stream_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl LayoutEntity {
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>, columns: u8, rows: u8) -> Self {
        Self {
            id: generate_id(),
            owner_id: owner_id.into(),
            updated_at: now_millis(),
            is_active: true,
            name: name.into(),
            stream_ids: Vec::new(),
            columns,
            rows,
            focused_stream_id: None,
            audio_stream_id: None,
        }
    }

    /// Number of grid slots
    pub fn capacity(&self) -> usize {
        self.columns as usize * self.rows as usize
    }
}

impl SyncEntity for LayoutEntity {
    const KIND: EntityKind = EntityKind::Layout;
    const LOCAL_FIELDS: &'static [&'static str] = &["focusedStreamId", "audioStreamId"];

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
