/// Receive window and duplicate filter for one `(sender, scope)` stream.
///
/// Pure state machine: the caller feeds arrivals and gets back what became
/// deliverable. Every seqno is classified exactly once as `New`; any later
/// copy is `Duplicate` (still tracked) or `Stale` (already purged).
use std::collections::BTreeMap;

use groupcast_metrics::Watermark;

use crate::message::DataMessage;
use crate::types::WindowKey;

/// How an arrival relates to what the window has already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// First copy of this seqno.
    New,
    /// Seen before and still tracked.
    Duplicate,
    /// At or below the stability watermark; state already discarded.
    Stale,
}

/// Result of feeding one arrival to the window.
#[derive(Debug, PartialEq, Eq)]
pub enum Receipt {
    Duplicate,
    Stale,
    Accepted {
        /// OOB message to hand to the unordered lane right now.
        unordered: Option<DataMessage>,
        /// Regular messages that became contiguous, in increasing seqno order.
        ordered: Vec<DataMessage>,
    },
}

/// A received message not yet covered by `highest_delivered`.
#[derive(Debug)]
struct Slot {
    msg: DataMessage,
    /// OOB messages are delivered on arrival; advancement only skips them.
    delivered: bool,
}

/// Tracks one stream's delivery progress.
///
/// `low_watermark <= highest_delivered` always holds, and every key in
/// `out_of_order` is strictly above `highest_delivered + 1`.
#[derive(Debug)]
pub struct ReceiveWindow {
    key: WindowKey,
    low_watermark: Watermark,
    highest_delivered: u64,
    highest_seen: u64,
    out_of_order: BTreeMap<u64, Slot>,
    /// Delivered group messages kept for peer-to-peer retransmission.
    retained: BTreeMap<u64, DataMessage>,
    last_activity_ms: u64,
}

impl ReceiveWindow {
    /// Fresh window; nothing delivered yet.
    pub fn new(key: WindowKey, now_ms: u64) -> Self {
        Self::starting_at(key, 0, now_ms)
    }

    /// Window whose history up to `floor` is already settled.
    ///
    /// Used for streams first observed mid-way (late join, evicted window).
    pub fn starting_at(key: WindowKey, floor: u64, now_ms: u64) -> Self {
        Self {
            key,
            low_watermark: Watermark::new(floor),
            highest_delivered: floor,
            highest_seen: floor,
            out_of_order: BTreeMap::new(),
            retained: BTreeMap::new(),
            last_activity_ms: now_ms,
        }
    }

    pub fn key(&self) -> WindowKey {
        self.key
    }

    pub fn low_watermark(&self) -> u64 {
        self.low_watermark.get()
    }

    pub fn highest_delivered(&self) -> u64 {
        self.highest_delivered
    }

    pub fn highest_seen(&self) -> u64 {
        self.highest_seen
    }

    pub fn buffered(&self) -> usize {
        self.out_of_order.len()
    }

    pub fn retained(&self) -> usize {
        self.retained.len()
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    /// Classify `seqno` without changing anything.
    pub fn classify(&self, seqno: u64) -> Classification {
        if seqno <= self.low_watermark.get() {
            Classification::Stale
        } else if seqno <= self.highest_delivered || self.out_of_order.contains_key(&seqno) {
            Classification::Duplicate
        } else {
            Classification::New
        }
    }

    /// Feed one arriving copy.
    pub fn receive(&mut self, msg: DataMessage, now_ms: u64) -> Receipt {
        match self.classify(msg.seqno) {
            Classification::Stale => return Receipt::Stale,
            Classification::Duplicate => return Receipt::Duplicate,
            Classification::New => {}
        }

        self.last_activity_ms = now_ms;
        self.highest_seen = self.highest_seen.max(msg.seqno);

        let seqno = msg.seqno;
        let unordered = msg.is_oob().then(|| msg.clone());
        self.out_of_order.insert(
            seqno,
            Slot {
                delivered: unordered.is_some(),
                msg,
            },
        );

        let ordered = if seqno == self.highest_delivered + 1 {
            self.advance()
        } else {
            Vec::new()
        };

        Receipt::Accepted { unordered, ordered }
    }

    /// Move `highest_delivered` across every contiguous slot.
    fn advance(&mut self) -> Vec<DataMessage> {
        let mut run = Vec::new();
        while let Some(slot) = self.out_of_order.remove(&(self.highest_delivered + 1)) {
            self.highest_delivered += 1;
            if self.key.scope.is_group() {
                self.retained.insert(slot.msg.seqno, slot.msg.clone());
            }
            if !slot.delivered {
                run.push(slot.msg);
            }
        }
        run
    }

    /// Record that the sender is known to have sent up to `seqno`.
    ///
    /// Lets a lost tail (nothing buffered above it) show up as a gap.
    pub fn hint_highest(&mut self, seqno: u64) {
        self.highest_seen = self.highest_seen.max(seqno);
    }

    /// The missing range blocking ordered delivery, if any.
    ///
    /// Returns `(from, to)` where `from = highest_delivered + 1` and `to` is
    /// one below the lowest buffered seqno, or the highest known seqno when
    /// nothing is buffered.
    pub fn missing(&self) -> Option<(u64, u64)> {
        let from = self.highest_delivered + 1;
        match self.out_of_order.keys().next() {
            Some(&lowest) => Some((from, lowest - 1)),
            None if self.highest_seen > self.highest_delivered => Some((from, self.highest_seen)),
            None => None,
        }
    }

    /// Raise the low watermark towards `up_to` and drop retained history.
    ///
    /// Clamped to `highest_delivered`: nothing undelivered is ever purged.
    /// Returns `true` if the watermark moved.
    pub fn truncate(&mut self, up_to: u64) -> bool {
        let target = up_to.min(self.highest_delivered);
        if !self.low_watermark.raise(target) {
            return false;
        }
        self.retained = match target.checked_add(1) {
            Some(next) => self.retained.split_off(&next),
            None => BTreeMap::new(),
        };
        true
    }

    /// Retained delivered messages in `from..=to` (group streams only).
    pub fn retained_range(&self, from: u64, to: u64) -> Vec<DataMessage> {
        if from > to {
            return Vec::new();
        }
        self.retained.range(from..=to).map(|(_, m)| m.clone()).collect()
    }

    /// Idle: no new arrival for `idle_ms` and no gap waiting to be filled.
    pub fn is_idle(&self, now_ms: u64, idle_ms: u64) -> bool {
        self.out_of_order.is_empty()
            && self.highest_seen <= self.highest_delivered
            && now_ms.saturating_sub(self.last_activity_ms) >= idle_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemberId, MessageClass, Scope};
    use bytes::Bytes;

    fn key() -> WindowKey {
        WindowKey::new(MemberId::from_u128(1), Scope::Group)
    }

    fn msg(seqno: u64, class: MessageClass) -> DataMessage {
        DataMessage {
            sender: MemberId::from_u128(1),
            scope: Scope::Group,
            seqno,
            class,
            payload: Bytes::from(seqno.to_be_bytes().to_vec()),
            stable_floor: 0,
        }
    }

    fn regular(seqno: u64) -> DataMessage {
        msg(seqno, MessageClass::Regular)
    }

    fn oob(seqno: u64) -> DataMessage {
        msg(seqno, MessageClass::OutOfBand)
    }

    fn ordered_seqnos(receipt: Receipt) -> Vec<u64> {
        match receipt {
            Receipt::Accepted { ordered, .. } => ordered.iter().map(|m| m.seqno).collect(),
            other => panic!("expected Accepted, got {other:?}"),
        }
    }

    #[test]
    fn in_order_arrivals_deliver_immediately() {
        let mut w = ReceiveWindow::new(key(), 0);
        assert_eq!(ordered_seqnos(w.receive(regular(1), 0)), vec![1]);
        assert_eq!(ordered_seqnos(w.receive(regular(2), 0)), vec![2]);
        assert_eq!(w.highest_delivered(), 2);
        assert!(w.missing().is_none());
    }

    #[test]
    fn gap_blocks_until_filled() {
        let mut w = ReceiveWindow::new(key(), 0);
        assert!(ordered_seqnos(w.receive(regular(3), 0)).is_empty());
        assert!(ordered_seqnos(w.receive(regular(2), 0)).is_empty());
        assert_eq!(w.missing(), Some((1, 1)));
        assert_eq!(ordered_seqnos(w.receive(regular(1), 0)), vec![1, 2, 3]);
        assert_eq!(w.highest_delivered(), 3);
        assert_eq!(w.buffered(), 0);
    }

    #[test]
    fn duplicates_are_dropped_everywhere() {
        let mut w = ReceiveWindow::new(key(), 0);
        w.receive(regular(1), 0);
        w.receive(regular(3), 0);
        // Below highest_delivered.
        assert_eq!(w.receive(regular(1), 0), Receipt::Duplicate);
        // Buffered out of order.
        assert_eq!(w.receive(regular(3), 0), Receipt::Duplicate);
        assert_eq!(w.classify(2), Classification::New);
    }

    #[test]
    fn oob_delivers_without_contiguity() {
        let mut w = ReceiveWindow::new(key(), 0);
        let receipt = w.receive(oob(5), 0);
        let Receipt::Accepted { unordered, ordered } = receipt else {
            panic!("expected Accepted");
        };
        assert_eq!(unordered.map(|m| m.seqno), Some(5));
        assert!(ordered.is_empty());
        assert_eq!(w.receive(oob(5), 0), Receipt::Duplicate);
    }

    #[test]
    fn advancement_skips_already_delivered_oob() {
        let mut w = ReceiveWindow::new(key(), 0);
        w.receive(oob(2), 0);
        w.receive(regular(3), 0);
        // 1 fills the gap; 2 was delivered already, only 1 and 3 go ordered.
        assert_eq!(ordered_seqnos(w.receive(regular(1), 0)), vec![1, 3]);
        assert_eq!(w.highest_delivered(), 3);
    }

    #[test]
    fn truncate_raises_and_is_clamped() {
        let mut w = ReceiveWindow::new(key(), 0);
        for s in 1..=4 {
            w.receive(regular(s), 0);
        }
        w.receive(regular(7), 0);
        assert_eq!(w.retained(), 4);

        // Cannot purge beyond what was delivered.
        assert!(w.truncate(10));
        assert_eq!(w.low_watermark(), 4);
        assert_eq!(w.retained(), 0);

        // Never lowers.
        assert!(!w.truncate(2));
        assert_eq!(w.low_watermark(), 4);

        assert_eq!(w.classify(3), Classification::Stale);
        assert_eq!(w.classify(7), Classification::Duplicate);
        assert_eq!(w.classify(5), Classification::New);
    }

    #[test]
    fn retained_range_serves_peers() {
        let mut w = ReceiveWindow::new(key(), 0);
        for s in 1..=5 {
            w.receive(regular(s), 0);
        }
        w.truncate(2);
        let seqnos: Vec<u64> = w.retained_range(1, 4).iter().map(|m| m.seqno).collect();
        assert_eq!(seqnos, vec![3, 4]);
    }

    #[test]
    fn unicast_windows_do_not_retain() {
        let key = WindowKey::new(MemberId::from_u128(1), Scope::Unicast(MemberId::from_u128(2)));
        let mut w = ReceiveWindow::new(key, 0);
        let mut m = regular(1);
        m.scope = key.scope;
        w.receive(m, 0);
        assert_eq!(w.highest_delivered(), 1);
        assert_eq!(w.retained(), 0);
    }

    #[test]
    fn window_starting_at_floor_treats_history_as_stale() {
        let mut w = ReceiveWindow::starting_at(key(), 10, 0);
        assert_eq!(w.receive(regular(10), 0), Receipt::Stale);
        assert_eq!(ordered_seqnos(w.receive(regular(11), 0)), vec![11]);
    }

    #[test]
    fn idle_requires_no_gap() {
        let mut w = ReceiveWindow::new(key(), 100);
        assert!(!w.is_idle(150, 100));
        assert!(w.is_idle(200, 100));
        w.receive(regular(3), 200);
        assert!(!w.is_idle(10_000, 100));
    }

    #[test]
    fn hinted_tail_loss_is_a_gap() {
        let mut w = ReceiveWindow::new(key(), 0);
        w.receive(regular(1), 0);
        assert_eq!(w.missing(), None);

        w.hint_highest(3);
        assert_eq!(w.missing(), Some((2, 3)));
        assert!(!w.is_idle(10_000, 100));

        w.receive(regular(2), 10);
        w.receive(regular(3), 10);
        assert_eq!(w.missing(), None);
    }
}
