//! Connection registry and fan-out
//!
//! The I/O thread registers and unregisters connections (exclusive lock);
//! broadcasts from the main thread, the encoder thread or anywhere else take
//! the shared lock. Every connection is represented by the sending half of
//! its outbound queue, drained by that connection's writer task.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::NetworkError;
use crate::protocol::PacketWrapper;

/// Identity of one viewer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work for a connection's writer task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// One binary message
    Data(Bytes),
    /// Close the connection with a reason
    Close(String),
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Set of open viewer connections
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, OutboundSender>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection and return its identity
    pub fn register(&self, sender: OutboundSender) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections.write().insert(id, sender);
        id
    }

    /// Remove a connection. Returns true if the registry became empty because
    /// of this call.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.write();
        connections.remove(&id).is_some() && connections.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Ask every connection to close with `reason` and forget them all
    pub fn close_all(&self, reason: &str) -> usize {
        let mut connections = self.connections.write();
        for (id, sender) in connections.iter() {
            if sender.send(Outbound::Close(reason.to_string())).is_err() {
                tracing::debug!("Connection {} already gone", id);
            }
        }
        let closed = connections.len();
        connections.clear();
        closed
    }

    /// Send `packet` to every connection except `exclude`.
    ///
    /// The packet is serialized once. A failing connection is logged and
    /// skipped; it stays registered until its own disconnect. Returns the
    /// number of connections the message was queued for.
    pub fn broadcast(&self, packet: &PacketWrapper, exclude: Option<ConnectionId>) -> usize {
        let bytes = match packet.encode() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::error!("Failed to encode {} packet: {}", packet.kind(), e);
                return 0;
            }
        };
        self.broadcast_bytes(bytes, exclude)
    }

    /// Send pre-encoded bytes to every connection except `exclude`
    pub fn broadcast_bytes(&self, bytes: Bytes, exclude: Option<ConnectionId>) -> usize {
        let connections = self.connections.read();
        let mut delivered = 0;
        for (id, sender) in connections.iter() {
            if Some(*id) == exclude {
                continue;
            }
            match sender.send(Outbound::Data(bytes.clone())) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    let e = NetworkError::SendFailed(format!("connection {} is closed", id));
                    tracing::warn!("{}", e);
                }
            }
        }
        delivered
    }

    /// Send `packet` to exactly one connection
    pub fn send_to(&self, id: ConnectionId, packet: &PacketWrapper) -> Result<(), NetworkError> {
        let bytes = Bytes::from(packet.encode()?);
        let connections = self.connections.read();
        let sender = connections
            .get(&id)
            .ok_or_else(|| NetworkError::SendFailed(format!("unknown connection {}", id)))?;
        sender
            .send(Outbound::Data(bytes))
            .map_err(|_| NetworkError::SendFailed(format!("connection {} is closed", id)))
    }
}
