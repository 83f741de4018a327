// wapp-api: Wire-level client for the wapp stream service (REST + WebSocket)

pub mod error;
pub mod frame;
pub mod rest;
pub mod transport;
pub mod websocket;

pub use error::Error;
pub use frame::{EventFrame, EventKind, Frame, FrameMeta, RpcError, RpcRequest, RpcResponse};
pub use rest::RestClient;
pub use transport::{SESSION_HEADER, TlsMode, TransportConfig};
pub use websocket::{ConnectionState, FrameSink, ReconnectConfig, WebSocketHandle};
