// ── Stream event domain type ──
//
// The runtime's view of a server-pushed event frame: normalised path,
// resolved kind, and the payload left as JSON for the receiving object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use wapp_api::{EventFrame, EventKind, FrameMeta};

use super::path::ModelPath;

/// `meta_object.type` carried by notification frames.
pub const NOTIFICATION_TYPE: &str = "notification";

/// One event delivered over the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub path: ModelPath,
    pub kind: EventKind,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<FrameMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_object: Option<FrameMeta>,
    pub received_at: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(path: impl Into<ModelPath>, kind: EventKind, data: Value) -> Self {
        Self {
            path: path.into(),
            kind,
            data,
            meta: None,
            meta_object: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_meta_object(mut self, kind: &str) -> Self {
        self.meta_object = Some(FrameMeta {
            kind: Some(kind.to_owned()),
            ..FrameMeta::default()
        });
        self
    }

    /// Metadata of the object the event is about: `data.meta` when the
    /// payload carries one, else the frame-level `meta`.
    pub fn object_meta(&self) -> Option<FrameMeta> {
        self.data
            .get("meta")
            .and_then(|m| serde_json::from_value::<FrameMeta>(m.clone()).ok())
            .or_else(|| self.meta.clone())
    }

    /// `meta_object.type`, if any.
    pub fn object_type(&self) -> Option<&str> {
        self.meta_object.as_ref().and_then(|m| m.kind.as_deref())
    }

    pub fn is_notification(&self) -> bool {
        self.object_type() == Some(NOTIFICATION_TYPE)
    }
}

impl From<EventFrame> for StreamEvent {
    /// A frame without an `event` field is a direct message.
    fn from(frame: EventFrame) -> Self {
        Self {
            path: ModelPath::new(&frame.path),
            kind: frame.event.unwrap_or(EventKind::Direct),
            data: frame.data,
            meta: frame.meta,
            meta_object: frame.meta_object,
            received_at: Utc::now(),
        }
    }
}
