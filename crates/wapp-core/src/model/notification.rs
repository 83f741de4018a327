use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::event::StreamEvent;

/// The user granted access to existing data.
pub const CODE_ACCESS_GRANTED: i64 = 1_100_004;
/// The user granted access to save data under their account.
pub const CODE_SAVE_GRANTED: i64 = 1_100_013;

/// Core fields of a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationBase {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub ids: Vec<String>,
}

/// A notification pushed on the `notification` topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    #[serde(default)]
    pub base: NotificationBase,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NotificationRecord {
    /// Decode the notification carried by `event`, if it is one.
    pub fn from_event(event: &StreamEvent) -> Option<Self> {
        if !event.is_notification() {
            return None;
        }
        serde_json::from_value(event.data.clone()).ok()
    }

    pub fn code(&self) -> i64 {
        self.base.code
    }

    pub fn ids(&self) -> &[String] {
        &self.base.ids
    }

    /// Whether this notification signals a granted permission.
    pub fn is_grant(&self) -> bool {
        matches!(self.base.code, CODE_ACCESS_GRANTED | CODE_SAVE_GRANTED)
    }
}
