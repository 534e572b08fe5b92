//! Action executor: the only place that touches I/O.
//!
//! Takes the `EngineAction`s produced by the engine and executes them:
//! - Send -> transport.send_raw()
//! - Deliver -> delivery_tx.send() (awaited, never dropped)
//! - Event -> event_tx.try_send()

use tokio::sync::mpsc;

use crate::engine::{EngineAction, ProtocolEvent};
use crate::error::ProtocolError;
use crate::lanes::Delivery;
use crate::message::Packet;
use crate::types::MemberId;

use super::transport::Transport;

/// Execute a batch of actions in order.
pub(super) async fn execute_actions<T: Transport>(
    actions: Vec<EngineAction>,
    transport: &T,
    delivery_tx: &mpsc::Sender<Delivery>,
    event_tx: &mpsc::Sender<ProtocolEvent>,
) {
    for action in actions {
        match action {
            EngineAction::Send { to, packet } => {
                send_packet(transport, to, &packet, event_tx).await;
            }
            EngineAction::Deliver(delivery) => {
                // Awaited: an accepted message is never dropped on the floor.
                if delivery_tx.send(delivery).await.is_err() {
                    tracing::debug!("delivery receiver dropped");
                }
            }
            EngineAction::Event(event) => {
                let _ = event_tx.try_send(event);
            }
        }
    }
}

async fn send_packet<T: Transport>(
    transport: &T,
    to: MemberId,
    packet: &Packet,
    event_tx: &mpsc::Sender<ProtocolEvent>,
) {
    let result = match packet.to_bytes() {
        Ok(bytes) => transport
            .send_raw(to, &bytes)
            .await
            .map_err(ProtocolError::Transport),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        // Loss is recovered by retransmission; just surface it.
        tracing::debug!(to = %to, kind = packet.kind(), "send failed: {e}");
        let _ = event_tx.try_send(ProtocolEvent::Error {
            description: format!("send {} to {to} failed: {e}", packet.kind()),
        });
    }
}
