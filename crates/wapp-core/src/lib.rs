//! Stream-synchronised object runtime on top of `wapp-api`.
//!
//! One long-lived WebSocket carries every server-pushed event. This crate
//! keeps local objects in sync with it and exposes the request/wait
//! primitives built on the same stream:
//!
//! - **[`Runtime`]**: Facade owning the connection.
//!   [`connect()`](Runtime::connect) spawns the connection manager and the
//!   single dispatch task; [`load()`](Runtime::load) and
//!   [`create()`](Runtime::create) register objects for updates.
//!
//! - **[`EventRouter`]**: Classifies each inbound frame: responses go to
//!   the [`RequestCorrelator`], paths under a subscribed prefix to the
//!   [`ServiceRegistry`], everything else to the object registered at the
//!   path in the [`ObjectRegistry`].
//!
//! - **[`PermissionNegotiator`]**: Asks the user for access to their data
//!   and waits on the `notification` topic for the grant.
//!   [`OAuthTokens`] does the same for OAuth connections.
//!
//! - **Domain model** ([`model`]): [`ModelPath`], [`StreamEvent`],
//!   [`RemoteObject`] and the [`StreamModel`] trait the router dispatches
//!   through.

pub mod api;
pub mod config;
pub mod correlator;
pub mod error;
pub mod model;
pub mod oauth;
pub mod permission;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod stream;
pub mod subscription;

// ── Primary re-exports ──────────────────────────────────────────────
pub use api::RestApi;
pub use config::{DEFAULT_BASE_URL, RuntimeConfig, TlsVerification, Validation, stream_url_for};
pub use correlator::RequestCorrelator;
pub use error::CoreError;
pub use oauth::OAuthTokens;
pub use permission::{PermissionNegotiator, PermissionRequest, Quantity};
pub use registry::ObjectRegistry;
pub use router::{EventRouter, Route};
pub use runtime::Runtime;
pub use stream::{ModelStream, ModelWatchStream};
pub use subscription::{
    ServiceFlow, ServiceRegistry, ServiceStream, SubscriptionGuard, SubscriptionHandle,
};

pub use model::{
    EventKind, ModelKind, ModelPath, NotificationRecord, ObjectSnapshot, RemoteObject,
    StreamEvent, StreamModel,
};

// Connection types live in the wire crate; re-export so consumers need
// only this one.
pub use wapp_api::{ConnectionState, ReconnectConfig};
