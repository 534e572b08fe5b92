/// Delivery scenarios over a duplicating network.
///
/// Each scenario sends values `1..=n` from one or more members, waits for
/// every destination to see them, and checks that nothing was lost, nothing
/// was delivered twice and regular traffic kept its order. It then runs
/// stability rounds until all retransmission history has been released.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use groupcast_protocol::{DeliveryOrdering, MemberId, ProtocolEvent, Scope};

use crate::cluster::{Cluster, Received, SendPattern};
use crate::events::{emit, now_iso, EventMemberStats, EventProtocol};
use crate::scenario_common::{check_ordered, check_presence, timed_step_async, ScenarioResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scenario {
    RegularUnicastSelf,
    OobUnicastSelf,
    RegularUnicastOthers,
    OobUnicastOthers,
    RegularMulticast,
    OobMulticast,
    #[value(name = "regular-multicast-3-senders")]
    RegularMulticast3Senders,
    #[value(name = "oob-multicast-3-senders")]
    OobMulticast3Senders,
    MixedMulticast,
}

/// Who a scenario's senders address.
#[derive(Debug, Clone, Copy)]
enum Target {
    Myself,
    EveryOther,
    Group,
}

impl Scenario {
    pub const ALL: [Scenario; 9] = [
        Scenario::RegularUnicastSelf,
        Scenario::OobUnicastSelf,
        Scenario::RegularUnicastOthers,
        Scenario::OobUnicastOthers,
        Scenario::RegularMulticast,
        Scenario::OobMulticast,
        Scenario::RegularMulticast3Senders,
        Scenario::OobMulticast3Senders,
        Scenario::MixedMulticast,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::RegularUnicastSelf => "regular-unicast-self",
            Scenario::OobUnicastSelf => "oob-unicast-self",
            Scenario::RegularUnicastOthers => "regular-unicast-others",
            Scenario::OobUnicastOthers => "oob-unicast-others",
            Scenario::RegularMulticast => "regular-multicast",
            Scenario::OobMulticast => "oob-multicast",
            Scenario::RegularMulticast3Senders => "regular-multicast-3-senders",
            Scenario::OobMulticast3Senders => "oob-multicast-3-senders",
            Scenario::MixedMulticast => "mixed-multicast",
        }
    }

    fn target(self) -> Target {
        match self {
            Scenario::RegularUnicastSelf | Scenario::OobUnicastSelf => Target::Myself,
            Scenario::RegularUnicastOthers | Scenario::OobUnicastOthers => Target::EveryOther,
            _ => Target::Group,
        }
    }

    fn pattern(self) -> SendPattern {
        match self {
            Scenario::RegularUnicastSelf
            | Scenario::RegularUnicastOthers
            | Scenario::RegularMulticast
            | Scenario::RegularMulticast3Senders => SendPattern::Regular,
            Scenario::MixedMulticast => SendPattern::Mixed,
            _ => SendPattern::OutOfBand,
        }
    }

    fn sender_count(self) -> usize {
        match self {
            Scenario::RegularMulticast3Senders
            | Scenario::OobMulticast3Senders
            | Scenario::MixedMulticast => 3,
            _ => 1,
        }
    }

    /// Smallest group the scenario makes sense in.
    pub fn min_members(self) -> usize {
        match self.target() {
            Target::Myself => 1,
            Target::EveryOther => 2,
            Target::Group => self.sender_count(),
        }
    }
}

/// Knobs shared by every scenario in a run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub messages: u64,
    pub delivery_timeout: Duration,
    pub quiet_period: Duration,
    pub stability_timeout: Duration,
}

pub async fn run(
    cluster: &mut Cluster,
    scenario: Scenario,
    settings: &RunSettings,
) -> anyhow::Result<ScenarioResult> {
    let name = scenario.name();
    let mut result = ScenarioResult::new(name);
    let start = Instant::now();

    if cluster.len() < scenario.min_members() {
        anyhow::bail!(
            "{name} needs at least {} members, cluster has {}",
            scenario.min_members(),
            cluster.len()
        );
    }

    let n = settings.messages;
    let senders: Vec<usize> = (0..scenario.sender_count()).collect();
    let target = scenario.target();
    let pattern = scenario.pattern();

    // ── Send ───────────────────────────────────────────────────────
    let cluster_ref = &*cluster;
    let step = timed_step_async("send", || async {
        for &from in &senders {
            match target {
                Target::Myself => {
                    let scope = Scope::Unicast(cluster_ref.id(from));
                    cluster_ref.send_values(from, scope, n, pattern).await?;
                }
                Target::EveryOther => {
                    for to in (0..cluster_ref.len()).filter(|&to| to != from) {
                        let scope = Scope::Unicast(cluster_ref.id(to));
                        cluster_ref.send_values(from, scope, n, pattern).await?;
                    }
                }
                Target::Group => {
                    cluster_ref.send_values(from, Scope::Group, n, pattern).await?;
                }
            }
        }
        Ok(format!("{} sender(s), {n} values each", senders.len()))
    })
    .await;
    result.add(step);

    // ── Collect and check ──────────────────────────────────────────
    let expected_from = expected_senders(cluster, &senders, target);
    let expected_counts: Vec<usize> = expected_from
        .iter()
        .map(|from| from.len() * n as usize)
        .collect();
    let collected = cluster
        .collect_all(
            &expected_counts,
            settings.delivery_timeout,
            settings.quiet_period,
        )
        .await;

    for (index, outcome) in collected.into_iter().enumerate() {
        if expected_counts[index] == 0 {
            continue;
        }
        let member = cluster.name(index).to_string();
        let expected_ids = &expected_from[index];
        let step = timed_step_async(&format!("deliveries at {member}"), || async {
            let by_sender = outcome?;
            check_member(&by_sender, expected_ids, n, pattern)
        })
        .await;
        result.add(step);
    }

    // ── Stability ──────────────────────────────────────────────────
    let mut final_stats = Vec::new();
    let step = timed_step_async("stability", || async {
        final_stats = cluster.await_stable(settings.stability_timeout).await?;
        Ok("all history released".to_string())
    })
    .await;
    result.add(step);

    for (index, stats) in final_stats.iter().enumerate() {
        emit(&EventMemberStats {
            event: "member_stats",
            scenario: name,
            member: cluster.name(index).to_string(),
            stats,
        });
    }

    // ── Protocol events ────────────────────────────────────────────
    let events = cluster.drain_events();
    let mut failures = Vec::new();
    for (member, event) in &events {
        if matches!(
            event,
            ProtocolEvent::PersistentGap { .. } | ProtocolEvent::Error { .. }
        ) {
            failures.push(format!("{member}: {event:?}"));
        }
        emit(&EventProtocol {
            event: "protocol_event",
            scenario: name.to_string(),
            member: member.clone(),
            detail: format!("{event:?}"),
            timestamp: now_iso(),
        });
    }
    let step = timed_step_async("no unrecoverable gaps", || async {
        if failures.is_empty() {
            Ok(format!("{} protocol event(s)", events.len()))
        } else {
            Err(failures.join("; "))
        }
    })
    .await;
    result.add(step);

    result.finalize(start);
    Ok(result)
}

/// For every member, the senders it should hear from.
fn expected_senders(cluster: &Cluster, senders: &[usize], target: Target) -> Vec<Vec<MemberId>> {
    (0..cluster.len())
        .map(|receiver| match target {
            Target::Myself => senders
                .iter()
                .filter(|&&s| s == receiver)
                .map(|&s| cluster.id(s))
                .collect(),
            Target::EveryOther => senders
                .iter()
                .filter(|&&s| s != receiver)
                .map(|&s| cluster.id(s))
                .collect(),
            Target::Group => senders.iter().map(|&s| cluster.id(s)).collect(),
        })
        .collect()
}

fn check_member(
    by_sender: &HashMap<MemberId, Vec<Received>>,
    expected: &[MemberId],
    n: u64,
    pattern: SendPattern,
) -> Result<String, String> {
    if let Some(stranger) = by_sender.keys().find(|s| !expected.contains(s)) {
        return Err(format!("unexpected deliveries from {stranger}"));
    }

    for sender in expected {
        let received = by_sender.get(sender).map(Vec::as_slice).unwrap_or(&[]);
        let values: Vec<u64> = received.iter().map(|r| r.value).collect();
        match pattern {
            SendPattern::Regular => {
                check_ordered(&values, n).map_err(|e| format!("from {sender}: {e}"))?;
                if received
                    .iter()
                    .any(|r| r.ordering != DeliveryOrdering::Ordered)
                {
                    return Err(format!("from {sender}: regular message delivered unordered"));
                }
            }
            SendPattern::OutOfBand => {
                check_presence(&values, n).map_err(|e| format!("from {sender}: {e}"))?;
            }
            SendPattern::Mixed => {
                check_presence(&values, n).map_err(|e| format!("from {sender}: {e}"))?;
                let ordered: Vec<u64> = received
                    .iter()
                    .filter(|r| r.ordering == DeliveryOrdering::Ordered)
                    .map(|r| r.value)
                    .collect();
                if ordered.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(format!("from {sender}: regular subset out of order {ordered:?}"));
                }
            }
        }
    }
    Ok(format!("{} sender(s) x {n}", expected.len()))
}
