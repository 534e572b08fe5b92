//! End-to-end harness: a handful of `GroupRuntime`s talking over an
//! in-memory network, optionally through a fault-injecting transport.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use groupcast_protocol::testing::{FaultConfig, FaultyTransport};
use groupcast_protocol::{
    Delivery, DeliveryConfig, GroupRuntime, MemberId, MemoryNetwork, MessageClass,
    ProtocolEvent, RuntimeChannels, Scope, View,
};

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Timers short enough for tests to converge in well under a second.
pub fn fast_config() -> DeliveryConfig {
    DeliveryConfig::new()
        .gap_timeout(Duration::from_millis(20))
        .retransmit_backoff(Duration::from_millis(20), Duration::from_millis(200), 50)
        .retransmit_check_interval(Duration::from_millis(10))
        .stability_interval(Duration::from_millis(100))
}

/// Payload helper: values travel as big-endian `u64`.
pub fn value_of(delivery: &Delivery) -> u64 {
    let mut buf = [0u8; 8];
    if delivery.payload.len() == 8 {
        buf.copy_from_slice(&delivery.payload);
    }
    u64::from_be_bytes(buf)
}

/// Group deliveries by sender, keeping arrival order.
pub fn per_sender(deliveries: &[Delivery]) -> HashMap<MemberId, Vec<u64>> {
    let mut out: HashMap<MemberId, Vec<u64>> = HashMap::new();
    for d in deliveries {
        out.entry(d.sender).or_default().push(value_of(d));
    }
    out
}

pub struct TestGroup {
    network: MemoryNetwork,
    ids: Vec<MemberId>,
    pub members: Vec<RuntimeChannels>,
}

impl TestGroup {
    /// Start `size` members with the given faults and install view 1.
    pub async fn start(size: usize, faults: FaultConfig) -> anyhow::Result<Self> {
        let network = MemoryNetwork::new();
        let ids: Vec<MemberId> = (1..=size as u128).map(MemberId::from_u128).collect();
        let members = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let member_faults = faults.clone().seed(faults.seed.wrapping_add(i as u64));
                let transport = FaultyTransport::new(network.endpoint(*id), member_faults);
                GroupRuntime::spawn(*id, transport, fast_config())
            })
            .collect();
        let group = Self {
            network,
            ids: ids.clone(),
            members,
        };
        group.install(View::new(1, ids)).await?;
        tracing::info!(size, "test group started");
        Ok(group)
    }

    pub fn id(&self, index: usize) -> MemberId {
        self.ids[index]
    }

    /// Install `view` on every member it contains.
    pub async fn install(&self, view: View) -> anyhow::Result<()> {
        tracing::debug!(view_id = view.view_id, size = view.len(), "installing view");
        for (id, member) in self.ids.iter().zip(&self.members) {
            if view.contains(id) {
                member.handle.view_change(view.clone()).await?;
            }
        }
        Ok(())
    }

    /// Send `values` from member `from`, each with its own class.
    pub async fn send_values(
        &self,
        from: usize,
        scope: Scope,
        values: impl IntoIterator<Item = (u64, MessageClass)>,
    ) -> anyhow::Result<()> {
        for (value, class) in values {
            self.members[from]
                .handle
                .send(scope, value.to_be_bytes().to_vec(), class)
                .await
                .with_context(|| format!("send {value} from member {from}"))?;
        }
        Ok(())
    }

    /// Receive exactly `count` deliveries at `member`.
    pub async fn recv_deliveries(
        &mut self,
        member: usize,
        count: usize,
        timeout: Duration,
    ) -> anyhow::Result<Vec<Delivery>> {
        let mut out = Vec::with_capacity(count);
        let deadline = Instant::now() + timeout;
        while out.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.members[member].deliveries.recv()).await {
                Ok(Some(d)) => out.push(d),
                Ok(None) => bail!("member {member}: delivery channel closed"),
                Err(_) => bail!(
                    "member {member}: only {}/{count} deliveries within {timeout:?}",
                    out.len()
                ),
            }
        }
        Ok(out)
    }

    /// Fail if `member` delivers anything within `window`.
    pub async fn assert_quiet(&mut self, member: usize, window: Duration) -> anyhow::Result<()> {
        if let Ok(Some(extra)) =
            tokio::time::timeout(window, self.members[member].deliveries.recv()).await
        {
            bail!(
                "member {member}: unexpected delivery of {} from {}",
                value_of(&extra),
                extra.sender
            );
        }
        Ok(())
    }

    /// Drive stability rounds on `members` until none retains sent history.
    pub async fn wait_stable(&self, members: &[usize], timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut unstable = 0;
            for &m in members {
                self.members[m].handle.run_gc().await?;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            for &m in members {
                unstable += self.members[m].handle.stats().await?.unstable_sent;
            }
            if unstable == 0 {
                return Ok(());
            }
            tracing::debug!(unstable, "waiting for stability");
            if Instant::now() >= deadline {
                bail!("{unstable} sent messages still unstable after {timeout:?}");
            }
        }
    }

    /// Cut a member off the network and stop its runtime.
    pub async fn kill(&self, member: usize) {
        tracing::info!(member, id = %self.ids[member], "killing member");
        self.network.disconnect(&self.ids[member]);
        self.members[member].handle.shutdown().await;
    }

    /// Events raised so far by `member`.
    pub fn drain_events(&mut self, member: usize) -> Vec<ProtocolEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.members[member].events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn shutdown(&self) {
        for member in &self.members {
            member.handle.shutdown().await;
        }
    }
}
