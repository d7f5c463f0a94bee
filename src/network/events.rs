//! Events marshaled from the I/O thread to the main thread
//!
//! The queue is multi-producer single-consumer. Each connection's reader
//! enqueues in receive order, so per-connection order holds; nothing is
//! promised across connections.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::network::registry::ConnectionId;
use crate::protocol::PacketWrapper;

#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A viewer connected and was registered
    Connected(ConnectionId),
    /// A viewer sent a message; `None` when it could not be decoded
    Message {
        from: ConnectionId,
        packet: Option<PacketWrapper>,
    },
    /// The last registered viewer disconnected, or every viewer was closed
    RegistryEmptied,
}

pub type EventSender = Sender<ServerEvent>;
pub type EventReceiver = Receiver<ServerEvent>;

pub fn event_queue() -> (EventSender, EventReceiver) {
    unbounded()
}
