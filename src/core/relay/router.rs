//! Message routing between connected endpoints.
//!
//! `Relay` owns the room registry and one outbound queue per connection.
//! Delivery uses `try_send`, so a slow or stalled socket only loses its own
//! messages and never holds up a room.

use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use super::registry::RoomRegistry;
use super::{EndpointId, RoomId};
use crate::core::error::RelayError;

pub type Outbound = mpsc::Sender<ServerMessage>;

#[derive(Debug, Default)]
pub struct Relay {
    registry: RoomRegistry,
    connections: RwLock<HashMap<EndpointId, Outbound>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Registers a new connection and issues its endpoint id.
    pub async fn connect(&self, outbound: Outbound) -> EndpointId {
        let endpoint = EndpointId::new();
        self.connections.write().await.insert(endpoint, outbound);
        info!(event = "endpoint_connected", endpoint = %endpoint, "Endpoint connected");
        endpoint
    }

    /// Drops a connection: removes it from its room and tells the remaining
    /// members it is gone.
    pub async fn disconnect(&self, endpoint: EndpointId) {
        self.connections.write().await.remove(&endpoint);
        if let Some(room) = self.registry.leave(endpoint).await {
            self.announce_departure(&room, endpoint).await;
        }
        let rooms = self.registry.room_count().await;
        info!(event = "endpoint_disconnected", endpoint = %endpoint, rooms, "Endpoint disconnected");
    }

    /// Entry point for one inbound text frame. Malformed input is answered
    /// with an `error` event to the sender only.
    pub async fn handle_text(&self, from: EndpointId, text: &str) {
        match ClientMessage::parse(text) {
            Ok(msg) => self.dispatch(from, msg).await,
            Err(e) => {
                warn!(event = "malformed_message", endpoint = %from, error = %e, "Rejecting malformed signaling message");
                self.deliver(
                    from,
                    ServerMessage::Error {
                        message: e.to_string(),
                    },
                )
                .await;
            }
        }
    }

    pub async fn dispatch(&self, from: EndpointId, msg: ClientMessage) {
        match msg {
            ClientMessage::Join(room) => self.join(from, room).await,
            forward => {
                let event = forward.event_name();
                let room = forward.room().clone();

                if self.registry.room_of(from).await.as_ref() != Some(&room) {
                    debug!(event = "forward_outside_room", endpoint = %from, room = %room, kind = event, "Sender is not a member of the room, dropping");
                    return;
                }

                match self.fan_out(&room, from, ServerMessage::from(forward)).await {
                    Ok(count) => {
                        debug!(event = "forwarded", endpoint = %from, room = %room, kind = event, recipients = count, "Signaling forwarded");
                    }
                    Err(e) => {
                        debug!(event = "routing_failure", endpoint = %from, kind = event, error = %e, "Nothing to forward to");
                    }
                }
            }
        }
    }

    async fn join(&self, endpoint: EndpointId, room: RoomId) {
        if let Some(previous) = self.registry.join(&room, endpoint).await {
            self.announce_departure(&previous, endpoint).await;
        }
        let members = self.registry.member_count(&room).await;
        info!(event = "room_joined", endpoint = %endpoint, room = %room, members, "Endpoint joined room");

        self.deliver(
            endpoint,
            ServerMessage::Joined {
                room_id: room.clone(),
            },
        )
        .await;
        let _ = self
            .fan_out(
                &room,
                endpoint,
                ServerMessage::PeerJoined {
                    room_id: room.clone(),
                    id: endpoint,
                },
            )
            .await;
    }

    async fn announce_departure(&self, room: &RoomId, endpoint: EndpointId) {
        let _ = self
            .fan_out(
                room,
                endpoint,
                ServerMessage::PeerLeft {
                    room_id: room.clone(),
                    id: endpoint,
                },
            )
            .await;
    }

    /// Sends `msg` to every member of `room` except `from`.
    async fn fan_out(
        &self,
        room: &RoomId,
        from: EndpointId,
        msg: ServerMessage,
    ) -> Result<usize, RelayError> {
        let members = self.registry.members_of(room, from).await;
        if members.is_empty() {
            return Err(RelayError::RoutingFailure(room.to_string()));
        }
        for member in &members {
            self.deliver(*member, msg.clone()).await;
        }
        Ok(members.len())
    }

    async fn deliver(&self, to: EndpointId, msg: ServerMessage) {
        let connections = self.connections.read().await;
        let Some(tx) = connections.get(&to) else {
            return;
        };
        match tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event = "outbound_full", endpoint = %to, "Outbound queue full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(event = "outbound_closed", endpoint = %to, "Outbound queue closed");
            }
        }
    }
}
