//! The session gateway: terminates client sessions over WebSocket,
//! authenticates the handshake, dispatches inbound events, and emits
//! outbound events with per-session duplicate suppression.

mod dispatch;
mod fanout_host;
mod protocol;
mod registry;
mod session;
mod ws;

pub use dispatch::{Gateway, GatewayConfig};
pub use fanout_host::spawn_fanout_host;
pub use protocol::{ClientEvent, ClientFrame, DisconnectReason, ServerFrame, message_payload};
pub use registry::SessionRegistry;
pub use session::Session;
pub use ws::{ShutdownSignal, ws_handler};
