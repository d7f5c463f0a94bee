//! Network subsystem: WebSocket server, connection registry, event queue

pub mod events;
pub mod registry;
pub mod server;

pub use events::{event_queue, EventReceiver, EventSender, ServerEvent};
pub use registry::{ConnectionId, ConnectionRegistry, Outbound, OutboundReceiver, OutboundSender};
pub use server::{BroadcastServer, RefreshCallback};
