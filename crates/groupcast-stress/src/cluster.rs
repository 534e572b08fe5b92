/// An in-process group: one `GroupRuntime` per member, all wired through a
/// shared `MemoryNetwork` behind fault-injecting transports.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use groupcast_protocol::testing::{FaultConfig, FaultyTransport};
use groupcast_protocol::{
    Delivery, DeliveryConfig, DeliveryOrdering, EngineStats, GroupRuntime, MemberId,
    MemoryNetwork, MessageClass, ProtocolEvent, RuntimeHandle, Scope, View,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// How a batch of sends is classed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPattern {
    Regular,
    OutOfBand,
    /// Even indices OOB, odd indices regular.
    Mixed,
}

impl SendPattern {
    fn class(self, index: u64) -> MessageClass {
        match self {
            SendPattern::Regular => MessageClass::Regular,
            SendPattern::OutOfBand => MessageClass::OutOfBand,
            SendPattern::Mixed if index % 2 == 0 => MessageClass::OutOfBand,
            SendPattern::Mixed => MessageClass::Regular,
        }
    }
}

/// One delivered value as the application saw it.
#[derive(Debug, Clone, Copy)]
pub struct Received {
    pub value: u64,
    pub ordering: DeliveryOrdering,
}

pub struct Member {
    pub id: MemberId,
    pub name: String,
    pub handle: RuntimeHandle,
    deliveries: Option<mpsc::Receiver<Delivery>>,
    events: mpsc::Receiver<ProtocolEvent>,
}

pub struct Cluster {
    members: Vec<Member>,
}

impl Cluster {
    /// Spawn `size` members and install a view containing all of them.
    pub async fn start(
        size: usize,
        faults: &FaultConfig,
        config: &DeliveryConfig,
    ) -> anyhow::Result<Self> {
        let network = MemoryNetwork::new();
        let ids: Vec<MemberId> = (1..=size as u128).map(MemberId::from_u128).collect();

        let mut members = Vec::with_capacity(size);
        for (i, id) in ids.iter().enumerate() {
            // Each member gets its own rng stream so runs stay reproducible.
            let member_faults = faults.clone().seed(faults.seed.wrapping_add(i as u64));
            let transport = FaultyTransport::new(network.endpoint(*id), member_faults);
            let channels = GroupRuntime::spawn(*id, transport, config.clone());
            members.push(Member {
                id: *id,
                name: format!("C{}", i + 1),
                handle: channels.handle,
                deliveries: Some(channels.deliveries),
                events: channels.events,
            });
        }

        let view = View::new(1, ids);
        for member in &members {
            member.handle.view_change(view.clone()).await?;
        }
        tracing::info!(size, "cluster started");
        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn id(&self, index: usize) -> MemberId {
        self.members[index].id
    }

    pub fn name(&self, index: usize) -> &str {
        &self.members[index].name
    }

    /// Send values `1..=n` from member `from`.
    pub async fn send_values(
        &self,
        from: usize,
        scope: Scope,
        n: u64,
        pattern: SendPattern,
    ) -> Result<(), String> {
        let handle = &self.members[from].handle;
        for i in 0..n {
            let value = i + 1;
            handle
                .send(scope, value.to_be_bytes().to_vec(), pattern.class(i))
                .await
                .map_err(|e| format!("{} send #{value} failed: {e}", self.members[from].name))?;
        }
        Ok(())
    }

    /// Wait until every member has seen its expected number of deliveries,
    /// then keep listening for `quiet` to catch anything delivered twice.
    /// Members are drained concurrently so no runtime stalls on a full
    /// delivery channel while another one is being read.
    pub async fn collect_all(
        &mut self,
        expected: &[usize],
        timeout: Duration,
        quiet: Duration,
    ) -> Vec<Result<HashMap<MemberId, Vec<Received>>, String>> {
        let mut set = JoinSet::new();
        for (index, member) in self.members.iter_mut().enumerate() {
            let want = expected.get(index).copied().unwrap_or(0);
            let Some(rx) = member.deliveries.take() else {
                continue;
            };
            let name = member.name.clone();
            set.spawn(async move {
                let (rx, result) = drain(rx, &name, want, timeout, quiet).await;
                (index, rx, result)
            });
        }

        let mut results: Vec<Result<HashMap<MemberId, Vec<Received>>, String>> = self
            .members
            .iter()
            .map(|m| Err(format!("{}: collector did not finish", m.name)))
            .collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, rx, result)) => {
                    self.members[index].deliveries = Some(rx);
                    results[index] = result;
                }
                Err(e) => tracing::warn!(error = %e, "collector task failed"),
            }
        }
        results
    }

    /// Run stability rounds until every member has released all history,
    /// or `timeout` passes. Returns the final statistics.
    pub async fn await_stable(&self, timeout: Duration) -> Result<Vec<EngineStats>, String> {
        let deadline = Instant::now() + timeout;
        loop {
            for member in &self.members {
                member.handle.run_gc().await.map_err(|e| e.to_string())?;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;

            let mut all = Vec::with_capacity(self.members.len());
            for member in &self.members {
                all.push(member.handle.stats().await.map_err(|e| e.to_string())?);
            }
            let settled = all
                .iter()
                .all(|s| s.unstable_sent == 0 && s.buffered_out_of_order == 0);
            if settled {
                return Ok(all);
            }
            if Instant::now() >= deadline {
                let pending: usize = all.iter().map(|s| s.unstable_sent).sum();
                return Err(format!("{pending} sent messages still unstable"));
            }
        }
    }

    /// Protocol events raised since the last call, tagged with the member name.
    pub fn drain_events(&mut self) -> Vec<(String, ProtocolEvent)> {
        let mut out = Vec::new();
        for member in &mut self.members {
            while let Ok(event) = member.events.try_recv() {
                out.push((member.name.clone(), event));
            }
        }
        out
    }

    pub async fn shutdown(&self) {
        for member in &self.members {
            member.handle.shutdown().await;
        }
    }
}

async fn drain(
    mut rx: mpsc::Receiver<Delivery>,
    name: &str,
    expected: usize,
    timeout: Duration,
    quiet: Duration,
) -> (
    mpsc::Receiver<Delivery>,
    Result<HashMap<MemberId, Vec<Received>>, String>,
) {
    let mut by_sender: HashMap<MemberId, Vec<Received>> = HashMap::new();
    let mut count = 0;
    let deadline = Instant::now() + timeout;

    while count < expected {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(d)) => {
                record(&mut by_sender, d);
                count += 1;
            }
            Ok(None) => return (rx, Err(format!("{name}: delivery channel closed"))),
            Err(_) => {
                let detail = format!("{name}: timeout with {count}/{expected} deliveries");
                return (rx, Err(detail));
            }
        }
    }

    while let Ok(Some(d)) = tokio::time::timeout(quiet, rx.recv()).await {
        record(&mut by_sender, d);
    }
    (rx, Ok(by_sender))
}

fn record(by_sender: &mut HashMap<MemberId, Vec<Received>>, d: Delivery) {
    let mut buf = [0u8; 8];
    let value = if d.payload.len() == 8 {
        buf.copy_from_slice(&d.payload);
        u64::from_be_bytes(buf)
    } else {
        0
    };
    by_sender.entry(d.sender).or_default().push(Received {
        value,
        ordering: d.ordering,
    });
}
