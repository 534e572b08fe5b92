/// Stability tracking: decides when buffered history can be discarded.
///
/// Every member periodically reports, per stream, the highest seqno it has
/// delivered contiguously. For each stream the stability watermark is the
/// minimum over the members that must have the data: the whole view for
/// `Scope::Group`, only the destination for `Scope::Unicast`.
///
/// Missed rounds: a reporter's last-known value stays valid. Values are
/// monotone per reporter, so an old value can only understate progress. A
/// required reporter that has never reported blocks the stream until it
/// reports or leaves the view.
use std::collections::{HashMap, HashSet};

use crate::error::ProtocolError;
use crate::message::StabilityDigest;
use crate::outbound::SequenceAssigner;
use crate::types::{MemberId, Scope, View, WindowKey};

#[derive(Debug)]
pub struct StabilityTracker {
    local_id: MemberId,
    view: View,
    /// stream → reporter → highest value it ever reported in this view.
    reports: HashMap<WindowKey, HashMap<MemberId, u64>>,
    /// Members caught reporting impossible values; ignored until removed.
    faulty: HashSet<MemberId>,
    /// Last watermark handed out per stream.
    applied: HashMap<WindowKey, u64>,
}

impl StabilityTracker {
    pub fn new(local_id: MemberId, view: View) -> Self {
        Self {
            local_id,
            view,
            reports: HashMap::new(),
            faulty: HashSet::new(),
            applied: HashMap::new(),
        }
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn is_faulty(&self, member: &MemberId) -> bool {
        self.faulty.contains(member)
    }

    /// Switch to a new view, forgetting everything about departed members.
    ///
    /// Reports *from* departed members are dropped so they can never hold
    /// back or lower a future watermark; streams *of* departed senders are
    /// dropped with them.
    pub fn install_view(&mut self, view: View) {
        self.reports.retain(|key, _| view.contains(&key.sender));
        for by_reporter in self.reports.values_mut() {
            by_reporter.retain(|reporter, _| view.contains(reporter));
        }
        self.applied.retain(|key, _| view.contains(&key.sender));
        self.faulty.retain(|member| view.contains(member));
        self.view = view;
    }

    /// Members whose report is needed for `key`.
    pub fn required_reporters(&self, key: &WindowKey) -> Vec<MemberId> {
        match key.scope {
            Scope::Group => self.view.members.clone(),
            Scope::Unicast(dest) => vec![dest],
        }
    }

    /// Accept a digest.
    ///
    /// Digests from non-members and faulty members are ignored. A report
    /// about our own stream above what we ever sent marks the reporter
    /// faulty and is returned as a violation.
    pub fn record(
        &mut self,
        digest: &StabilityDigest,
        sent: &SequenceAssigner,
    ) -> Result<(), ProtocolError> {
        let reporter = digest.reporter;
        if !self.view.contains(&reporter) || self.faulty.contains(&reporter) {
            return Ok(());
        }

        for entry in &digest.watermarks {
            if entry.sender == self.local_id {
                let highest = sent.highest_assigned(&entry.scope);
                if entry.highest_delivered > highest {
                    self.faulty.insert(reporter);
                    return Err(ProtocolError::ProtocolViolation {
                        member: reporter,
                        reason: format!(
                            "reported {} delivered on {} but only {} were sent",
                            entry.highest_delivered, entry.scope, highest
                        ),
                    });
                }
            }
        }

        for entry in &digest.watermarks {
            let key = entry.key();
            if !self.view.contains(&key.sender) {
                continue;
            }
            // Only the destination can vouch for a unicast stream, and only
            // its two endpoints care about it.
            if let Scope::Unicast(dest) = key.scope {
                if dest != reporter || (key.sender != self.local_id && dest != self.local_id) {
                    continue;
                }
            }
            let value = self
                .reports
                .entry(key)
                .or_default()
                .entry(reporter)
                .or_insert(0);
            *value = (*value).max(entry.highest_delivered);
        }
        Ok(())
    }

    /// Current stability point for `key`, if every required reporter is known.
    pub fn stable_point(&self, key: &WindowKey) -> Option<u64> {
        let by_reporter = self.reports.get(key)?;
        let mut min: Option<u64> = None;
        for member in self.required_reporters(key) {
            if self.faulty.contains(&member) {
                return None;
            }
            let value = *by_reporter.get(&member)?;
            min = Some(min.map_or(value, |m| m.min(value)));
        }
        min
    }

    /// Streams whose watermark advanced since the last call.
    pub fn evaluate(&mut self) -> Vec<(WindowKey, u64)> {
        let keys: Vec<WindowKey> = self.reports.keys().copied().collect();
        let mut advanced = Vec::new();
        for key in keys {
            let Some(point) = self.stable_point(&key) else {
                continue;
            };
            let applied = self.applied.entry(key).or_insert(0);
            if point > *applied {
                *applied = point;
                advanced.push((key, point));
            }
        }
        advanced.sort();
        advanced
    }

    /// Watermark handed out so far for `key` (0 if none).
    pub fn watermark(&self, key: &WindowKey) -> u64 {
        self.applied.get(key).copied().unwrap_or(0)
    }
}
