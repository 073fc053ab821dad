//! The real-time channel: WebSocket plumbing, the wire protocol, and the
//! router that dispatches inbound events to the domain services.

pub mod connection;
pub mod connection_manager;
pub mod handler;
pub mod messages;
pub mod router;

pub use connection::{Connection, SocketError, SocketWrapper};
pub use connection_manager::{ConnectionManager, InMemoryConnectionManager};
pub use handler::websocket_handler;
pub use messages::{MessageType, WireMessage};
pub use router::MessageRouter;
