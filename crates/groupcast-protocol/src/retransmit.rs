/// Gap tracking and retransmission scheduling.
///
/// Pure state machine driven by the engine: `observe` after every window
/// change, `poll` on a timer. A gap is requested once it has been open for
/// `gap_timeout`, then again with exponential backoff, and declared
/// persistent once the retry budget is spent. A persistent gap is reported
/// once and left alone; the ordered lane stays stalled until the data shows
/// up or the sender leaves the view.
use std::collections::HashMap;

use crate::config::DeliveryConfig;
use crate::types::{MemberId, WindowKey};

/// What the requester wants done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapAction {
    /// Ask for `from..=to`. `attempt` starts at 1.
    Request {
        key: WindowKey,
        from: u64,
        to: u64,
        attempt: u32,
    },
    /// Retry budget exhausted for this gap.
    Persistent {
        key: WindowKey,
        from: u64,
        to: u64,
        attempts: u32,
    },
}

#[derive(Debug)]
struct OpenGap {
    from: u64,
    to: u64,
    attempts: u32,
    next_due_ms: u64,
    exhausted: bool,
}

/// Open gaps for every window of this member.
#[derive(Debug, Default)]
pub struct RetransmitRequester {
    gaps: HashMap<WindowKey, OpenGap>,
}

impl RetransmitRequester {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current gap of a window (`None` once contiguous).
    ///
    /// A gap starting at the same seqno keeps its retry state even if its
    /// upper end moves; a gap starting elsewhere is a new gap.
    pub fn observe(
        &mut self,
        key: WindowKey,
        missing: Option<(u64, u64)>,
        now_ms: u64,
        config: &DeliveryConfig,
    ) {
        let Some((from, to)) = missing else {
            self.gaps.remove(&key);
            return;
        };

        match self.gaps.get_mut(&key) {
            Some(gap) if gap.from == from => gap.to = to,
            _ => {
                self.gaps.insert(
                    key,
                    OpenGap {
                        from,
                        to,
                        attempts: 0,
                        next_due_ms: now_ms.saturating_add(config.gap_timeout_ms()),
                        exhausted: false,
                    },
                );
            }
        }
    }

    /// Gaps whose timer has fired.
    pub fn poll(&mut self, now_ms: u64, config: &DeliveryConfig) -> Vec<GapAction> {
        let mut actions = Vec::new();
        for (key, gap) in &mut self.gaps {
            if gap.exhausted || now_ms < gap.next_due_ms {
                continue;
            }
            if gap.attempts >= config.max_retries {
                gap.exhausted = true;
                actions.push(GapAction::Persistent {
                    key: *key,
                    from: gap.from,
                    to: gap.to,
                    attempts: gap.attempts,
                });
                continue;
            }
            gap.next_due_ms = now_ms.saturating_add(config.backoff_ms(gap.attempts));
            gap.attempts += 1;
            actions.push(GapAction::Request {
                key: *key,
                from: gap.from,
                to: gap.to,
                attempt: gap.attempts,
            });
        }
        actions
    }

    /// Drop the gap of one window.
    pub fn forget(&mut self, key: &WindowKey) {
        self.gaps.remove(key);
    }

    /// Drop every gap of a departed sender.
    pub fn forget_sender(&mut self, sender: &MemberId) {
        self.gaps.retain(|key, _| key.sender != *sender);
    }

    /// Whether `key` has a gap that ran out of retries.
    #[cfg(test)]
    pub(crate) fn is_persistent(&self, key: &WindowKey) -> bool {
        self.gaps.get(key).is_some_and(|g| g.exhausted)
    }

    /// Number of open gaps.
    pub fn len(&self) -> usize {
        self.gaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scope;
    use std::time::Duration;

    fn key() -> WindowKey {
        WindowKey::new(MemberId::from_u128(1), Scope::Group)
    }

    fn config() -> DeliveryConfig {
        DeliveryConfig::new()
            .gap_timeout(Duration::from_millis(100))
            .retransmit_backoff(Duration::from_millis(50), Duration::from_millis(150), 3)
    }

    #[test]
    fn no_request_before_gap_timeout() {
        let cfg = config();
        let mut req = RetransmitRequester::new();
        req.observe(key(), Some((1, 4)), 1_000, &cfg);
        assert!(req.poll(1_099, &cfg).is_empty());

        let actions = req.poll(1_100, &cfg);
        assert_eq!(
            actions,
            vec![GapAction::Request { key: key(), from: 1, to: 4, attempt: 1 }]
        );
    }

    #[test]
    fn backoff_then_persistent() {
        let cfg = config();
        let mut req = RetransmitRequester::new();
        req.observe(key(), Some((1, 1)), 0, &cfg);

        assert_eq!(req.poll(100, &cfg).len(), 1); // attempt 1, next at +50
        assert!(req.poll(149, &cfg).is_empty());
        assert_eq!(req.poll(150, &cfg).len(), 1); // attempt 2, next at +100
        assert!(req.poll(249, &cfg).is_empty());
        assert_eq!(req.poll(250, &cfg).len(), 1); // attempt 3, next at +150 (capped)
        assert!(req.poll(399, &cfg).is_empty());

        let actions = req.poll(400, &cfg);
        assert_eq!(
            actions,
            vec![GapAction::Persistent { key: key(), from: 1, to: 1, attempts: 3 }]
        );
        assert!(req.is_persistent(&key()));

        // Reported once only.
        assert!(req.poll(10_000, &cfg).is_empty());
    }

    #[test]
    fn filling_the_gap_clears_state() {
        let cfg = config();
        let mut req = RetransmitRequester::new();
        req.observe(key(), Some((1, 2)), 0, &cfg);
        req.observe(key(), None, 10, &cfg);
        assert!(req.is_empty());
        assert!(req.poll(10_000, &cfg).is_empty());
    }

    #[test]
    fn moved_gap_restarts_timer() {
        let cfg = config();
        let mut req = RetransmitRequester::new();
        req.observe(key(), Some((1, 2)), 0, &cfg);
        req.poll(100, &cfg);

        // Lower end moved: new gap, fresh timeout.
        req.observe(key(), Some((5, 6)), 120, &cfg);
        assert!(req.poll(219, &cfg).is_empty());
        let actions = req.poll(220, &cfg);
        assert_eq!(
            actions,
            vec![GapAction::Request { key: key(), from: 5, to: 6, attempt: 1 }]
        );
    }

    #[test]
    fn same_start_keeps_attempts() {
        let cfg = config();
        let mut req = RetransmitRequester::new();
        req.observe(key(), Some((1, 5)), 0, &cfg);
        req.poll(100, &cfg);
        req.observe(key(), Some((1, 2)), 120, &cfg);
        let actions = req.poll(150, &cfg);
        assert_eq!(
            actions,
            vec![GapAction::Request { key: key(), from: 1, to: 2, attempt: 2 }]
        );
    }

    #[test]
    fn forget_sender_drops_all_its_gaps() {
        let cfg = config();
        let mut req = RetransmitRequester::new();
        let other = WindowKey::new(MemberId::from_u128(2), Scope::Group);
        req.observe(key(), Some((1, 1)), 0, &cfg);
        req.observe(other, Some((1, 1)), 0, &cfg);
        req.forget_sender(&MemberId::from_u128(1));
        assert_eq!(req.len(), 1);
    }
}
