use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::types::MemberId;

/// Network abstraction for the runtime.
///
/// Packets are opaque bytes. Delivery may lose, duplicate or reorder them;
/// the delivery engine copes with all three. A packet addressed to the
/// local member must come back through `recv_raw` (loopback).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send raw bytes to one member.
    async fn send_raw(&self, target: MemberId, data: &[u8]) -> Result<(), String>;

    /// Wait for the next packet. An error means the transport is closed.
    async fn recv_raw(&mut self) -> Result<(MemberId, Vec<u8>), String>;
}

// ── In-memory network ───────────────────────────────────────────────

type Inbox = mpsc::UnboundedSender<(MemberId, Vec<u8>)>;

/// In-process network connecting any number of endpoints.
///
/// Cheap to clone; clones share the same routing table.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<Mutex<HashMap<MemberId, Inbox>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `member` to the network. Re-attaching replaces the old endpoint.
    pub fn endpoint(&self, member: MemberId) -> MemoryEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(member, tx);
        MemoryEndpoint {
            local_id: member,
            network: self.clone(),
            inbox: rx,
        }
    }

    /// Detach `member`; packets to it fail from now on.
    pub fn disconnect(&self, member: &MemberId) {
        self.lock().remove(member);
    }

    fn route(&self, target: &MemberId) -> Option<Inbox> {
        self.lock().get(target).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MemberId, Inbox>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One member's attachment to a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    local_id: MemberId,
    network: MemoryNetwork,
    inbox: mpsc::UnboundedReceiver<(MemberId, Vec<u8>)>,
}

impl MemoryEndpoint {
    pub fn local_id(&self) -> MemberId {
        self.local_id
    }
}

#[async_trait::async_trait]
impl Transport for MemoryEndpoint {
    async fn send_raw(&self, target: MemberId, data: &[u8]) -> Result<(), String> {
        let inbox = self
            .network
            .route(&target)
            .ok_or_else(|| format!("no endpoint for {target}"))?;
        inbox
            .send((self.local_id, data.to_vec()))
            .map_err(|_| format!("endpoint {target} closed"))
    }

    async fn recv_raw(&mut self) -> Result<(MemberId, Vec<u8>), String> {
        self.inbox
            .recv()
            .await
            .ok_or_else(|| "network detached".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn endpoints_exchange_packets() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(MemberId::from_u128(1));
        let mut b = net.endpoint(MemberId::from_u128(2));

        a.send_raw(MemberId::from_u128(2), b"hello").await.unwrap();
        let (from, data) = b.recv_raw().await.unwrap();
        assert_eq!(from, MemberId::from_u128(1));
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn loopback_reaches_self() {
        let net = MemoryNetwork::new();
        let mut a = net.endpoint(MemberId::from_u128(1));
        a.send_raw(MemberId::from_u128(1), b"me").await.unwrap();
        let (from, _) = a.recv_raw().await.unwrap();
        assert_eq!(from, MemberId::from_u128(1));
    }

    #[tokio::test]
    async fn unknown_target_fails() {
        let net = MemoryNetwork::new();
        let a = net.endpoint(MemberId::from_u128(1));
        assert!(a.send_raw(MemberId::from_u128(9), b"x").await.is_err());

        let _b = net.endpoint(MemberId::from_u128(2));
        net.disconnect(&MemberId::from_u128(2));
        assert!(a.send_raw(MemberId::from_u128(2), b"x").await.is_err());
    }
}
