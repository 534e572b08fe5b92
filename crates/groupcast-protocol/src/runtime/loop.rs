/// The runtime event loop.
///
/// A single async task owns the member's `DeliveryEngine` and multiplexes
/// over inbound packets, application commands and timers. Every window of
/// the member is mutated from here only.
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::DeliveryConfig;
use crate::engine::{DeliveryEngine, ProtocolEvent};
use crate::lanes::Delivery;
use crate::message::Packet;

use super::executor::execute_actions;
use super::transport::Transport;
use super::RuntimeCommand;

/// Main event loop. Owns the engine.
pub(super) async fn runtime_loop<T: Transport>(
    mut engine: DeliveryEngine,
    mut transport: T,
    config: DeliveryConfig,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    delivery_tx: mpsc::Sender<Delivery>,
    event_tx: mpsc::Sender<ProtocolEvent>,
) {
    let local_id = engine.local_id();

    // Engine clock: milliseconds since this loop started, on tokio's
    // monotonic time.
    let origin = Instant::now();
    let now_ms = || origin.elapsed().as_millis() as u64;

    // ── Timers ──────────────────────────────────────────────────────
    let mut retransmit_check = tokio::time::interval(config.retransmit_check_interval);
    let mut stability_gossip = tokio::time::interval(config.stability_interval);
    let mut idle_check = tokio::time::interval(config.idle_check_interval);

    // Skip the immediate first tick on all intervals
    retransmit_check.tick().await;
    stability_gossip.tick().await;
    idle_check.tick().await;

    tracing::info!(member = %local_id, "delivery runtime started");

    loop {
        tokio::select! {
            // ── 1. Incoming packets ──────────────────────────────
            result = transport.recv_raw() => {
                match result {
                    Ok((from, data)) => {
                        let packet = match Packet::from_bytes(&data) {
                            Ok(p) => p,
                            Err(e) => {
                                engine.record_decode_error();
                                tracing::debug!(from = %from, "bad packet: {e}");
                                continue;
                            }
                        };
                        let actions = engine.handle_packet(from, packet, now_ms());
                        execute_actions(actions, &transport, &delivery_tx, &event_tx).await;
                    }
                    Err(e) => {
                        tracing::warn!(member = %local_id, "transport closed: {e}");
                        let _ = event_tx.try_send(ProtocolEvent::Error {
                            description: format!("recv error: {e}"),
                        });
                        break;
                    }
                }
            }

            // ── 2. Commands from application ────────────────────
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    // Every handle dropped.
                    break;
                };
                match cmd {
                    RuntimeCommand::Send { scope, payload, class, reply } => {
                        match engine.send(scope, payload, class) {
                            Ok((seqno, actions)) => {
                                let _ = reply.send(Ok(seqno));
                                execute_actions(actions, &transport, &delivery_tx, &event_tx).await;
                            }
                            Err(e) => {
                                tracing::warn!(member = %local_id, scope = %scope, "send rejected: {e}");
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    RuntimeCommand::ViewChange { view, reply } => {
                        let actions = engine.on_view_change(view);
                        let _ = reply.send(());
                        execute_actions(actions, &transport, &delivery_tx, &event_tx).await;
                    }
                    RuntimeCommand::RunGc => {
                        let actions = engine.stability_digest(now_ms());
                        execute_actions(actions, &transport, &delivery_tx, &event_tx).await;
                    }
                    RuntimeCommand::Stats { reply } => {
                        let _ = reply.send(engine.stats());
                    }
                    RuntimeCommand::Shutdown => {
                        break;
                    }
                }
            }

            // ── 3. Timers ───────────────────────────────────────
            _ = retransmit_check.tick() => {
                let actions = engine.tick_retransmit(now_ms());
                execute_actions(actions, &transport, &delivery_tx, &event_tx).await;
            }

            _ = stability_gossip.tick() => {
                let actions = engine.stability_digest(now_ms());
                execute_actions(actions, &transport, &delivery_tx, &event_tx).await;
            }

            _ = idle_check.tick() => {
                let actions = engine.tick_idle(now_ms());
                execute_actions(actions, &transport, &delivery_tx, &event_tx).await;
            }
        }
    }

    tracing::info!(member = %local_id, "delivery runtime stopped");
}
