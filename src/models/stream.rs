use crate::sync::{EntityKind, SyncEntity};
use crate::utils::{generate_id, now_millis};

use serde::{Deserialize, Serialize};

/// Streaming platform a channel lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Youtube,
    Kick,
    Rumble,
}

/// A followed live stream.
///
/// Title, category, viewer count and live flag come from the platform via the backend.
/// Mute state, volume and grid position are preferences of this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntity {
    pub id: String,
    pub owner_id: String,
    pub updated_at: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub platform: Platform,
    pub channel: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub viewer_count: u64,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default)]
    pub position: u32,
}

fn default_true() -> bool {
    true
}

fn default_volume() -> f64 {
    1.0
}

impl StreamEntity {
    pub fn new(owner_id: impl Into<String>, platform: Platform, channel: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            owner_id: owner_id.into(),
            updated_at: now_millis(),
            is_active: true,
            platform,
            channel: channel.into(),
            title: String::new(),
            category: None,
            viewer_count: 0,
            is_live: false,
            thumbnail_url: None,
            muted: false,
            volume: default_volume(),
            position: 0,
        }
    }
}

impl SyncEntity for StreamEntity {
    const KIND: EntityKind = EntityKind::Stream;
    const LOCAL_FIELDS: &'static [&'static str] = &["muted", "volume", "position"];

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
