/// Delivery runtime: drives one member's `DeliveryEngine` as a live task.
///
/// The runtime owns a `Transport` and the engine. It exposes a
/// channel-based API so the application never touches raw packets or
/// engine internals.
mod executor;
mod r#loop;
mod transport;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::config::DeliveryConfig;
use crate::engine::{DeliveryEngine, EngineStats, ProtocolEvent};
use crate::error::ProtocolError;
use crate::lanes::Delivery;
use crate::types::{MemberId, MessageClass, Scope, View};

pub use transport::{MemoryEndpoint, MemoryNetwork, Transport};

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands the application sends to the runtime event loop.
pub(crate) enum RuntimeCommand {
    /// Sequence and send a message; replies with the assigned seqno.
    Send {
        scope: Scope,
        payload: Bytes,
        class: MessageClass,
        reply: oneshot::Sender<Result<u64, ProtocolError>>,
    },
    /// Install a new membership view; replies once installed.
    ViewChange {
        view: View,
        reply: oneshot::Sender<()>,
    },
    /// Run a stability round now instead of waiting for the timer.
    RunGc,
    /// Query: engine statistics.
    Stats { reply: oneshot::Sender<EngineStats> },
    /// Graceful shutdown.
    Shutdown,
}

// ── RuntimeHandle (app-facing API) ───────────────────────────────────

/// Handle to communicate with a running `GroupRuntime`.
///
/// Cheap to clone. All methods are channel sends.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    local_id: MemberId,
}

impl RuntimeHandle {
    /// This member's identity.
    pub fn local_id(&self) -> MemberId {
        self.local_id
    }

    /// Send a message. Returns the seqno assigned within `scope`.
    pub async fn send(
        &self,
        scope: Scope,
        payload: impl Into<Bytes>,
        class: MessageClass,
    ) -> Result<u64, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCommand::Send {
                scope,
                payload: payload.into(),
                class,
                reply,
            })
            .await
            .map_err(|_| ProtocolError::RuntimeShutDown)?;
        rx.await.map_err(|_| ProtocolError::RuntimeShutDown)?
    }

    /// Regular multicast to the whole group.
    pub async fn multicast(&self, payload: impl Into<Bytes>) -> Result<u64, ProtocolError> {
        self.send(Scope::Group, payload, MessageClass::Regular).await
    }

    /// Install a new view delivered by the membership service.
    ///
    /// Returns once the view is in effect: data from members outside the
    /// installed view is dropped, so install before peers start sending.
    pub async fn view_change(&self, view: View) -> Result<(), ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCommand::ViewChange { view, reply })
            .await
            .map_err(|_| ProtocolError::RuntimeShutDown)?;
        rx.await.map_err(|_| ProtocolError::RuntimeShutDown)
    }

    /// Force a stability round (digest exchange + truncation).
    pub async fn run_gc(&self) -> Result<(), ProtocolError> {
        self.cmd_tx
            .send(RuntimeCommand::RunGc)
            .await
            .map_err(|_| ProtocolError::RuntimeShutDown)
    }

    /// Snapshot of the engine's statistics.
    pub async fn stats(&self) -> Result<EngineStats, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCommand::Stats { reply })
            .await
            .map_err(|_| ProtocolError::RuntimeShutDown)?;
        rx.await.map_err(|_| ProtocolError::RuntimeShutDown)
    }

    /// Graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown).await;
    }
}

// ── RuntimeChannels ──────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct RuntimeChannels {
    /// Handle to send commands to the runtime.
    pub handle: RuntimeHandle,
    /// Every message, exactly once, in the order the lanes release it.
    pub deliveries: mpsc::Receiver<Delivery>,
    /// Protocol-level events.
    pub events: mpsc::Receiver<ProtocolEvent>,
}

// ── GroupRuntime ─────────────────────────────────────────────────────

/// The delivery runtime. Spawn it and talk to it through channels.
pub struct GroupRuntime;

impl GroupRuntime {
    /// Create and start the runtime for `local_id`.
    ///
    /// Takes ownership of the transport. Spawns the event loop as a tokio
    /// task; must be called from within a tokio runtime. The member starts
    /// alone in view 0 until the first `view_change`.
    pub fn spawn<T: Transport>(
        local_id: MemberId,
        transport: T,
        config: DeliveryConfig,
    ) -> RuntimeChannels {
        let capacity = config.channel_capacity;

        // Command channel (app → runtime)
        let (cmd_tx, cmd_rx) = mpsc::channel::<RuntimeCommand>(capacity);

        // Output channels (runtime → app)
        let (delivery_tx, delivery_rx) = mpsc::channel::<Delivery>(capacity);
        let (event_tx, event_rx) = mpsc::channel::<ProtocolEvent>(capacity);

        let engine = DeliveryEngine::new(local_id, config.clone());
        tokio::spawn(r#loop::runtime_loop(
            engine,
            transport,
            config,
            cmd_rx,
            delivery_tx,
            event_tx,
        ));

        RuntimeChannels {
            handle: RuntimeHandle { cmd_tx, local_id },
            deliveries: delivery_rx,
            events: event_rx,
        }
    }
}
