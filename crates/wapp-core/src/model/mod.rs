// ── Domain model ──
//
// Paths, stream events, notifications, and the objects the router keeps
// in sync.

mod event;
mod notification;
mod object;
mod path;

pub use event::{NOTIFICATION_TYPE, StreamEvent};
pub use notification::{
    CODE_ACCESS_GRANTED, CODE_SAVE_GRANTED, NotificationBase, NotificationRecord,
};
pub use object::{
    API_VERSION, Effect, ModelKind, ObjectMeta, ObjectSnapshot, RemoteObject, StreamModel,
};
pub use path::ModelPath;

pub use wapp_api::{EventKind, FrameMeta};
