/// Delivery lanes: the last step before a payload reaches the application.
///
/// The ordered lane only ever sees contiguous runs produced by the receive
/// window; it keeps its own cursor and refuses anything that would skip or
/// repeat a seqno. The unordered lane is a pass-through for OOB messages.
use bytes::Bytes;
use serde::Serialize;

use crate::error::ProtocolError;
use crate::message::DataMessage;
use crate::types::{MemberId, Scope, WindowKey};

/// Ordering guarantee attached to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeliveryOrdering {
    /// Regular message, strictly in per-sender seqno order.
    Ordered,
    /// OOB message, delivered once with no ordering promise.
    Unordered,
}

/// A message handed to the application. Fired once per `(sender, scope, seqno)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sender: MemberId,
    pub scope: Scope,
    pub seqno: u64,
    pub payload: Bytes,
    pub ordering: DeliveryOrdering,
}

impl Delivery {
    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.sender, self.scope)
    }

    fn from_message(msg: DataMessage, ordering: DeliveryOrdering) -> Self {
        Self {
            sender: msg.sender,
            scope: msg.scope,
            seqno: msg.seqno,
            payload: msg.payload,
            ordering,
        }
    }
}

/// Per-stream cursor over regular deliveries.
#[derive(Debug)]
pub struct OrderedLane {
    key: WindowKey,
    cursor: u64,
}

impl OrderedLane {
    /// Lane whose cursor starts at the window's initial `highest_delivered`.
    pub fn new(key: WindowKey, cursor: u64) -> Self {
        Self { key, cursor }
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Turn a contiguous run into deliveries.
    ///
    /// The run may skip seqnos that were OOB (already delivered by the
    /// unordered lane), but must be strictly increasing and above the cursor.
    pub fn deliver(&mut self, run: Vec<DataMessage>) -> Result<Vec<Delivery>, ProtocolError> {
        let mut out = Vec::with_capacity(run.len());
        for msg in run {
            if msg.seqno <= self.cursor {
                return Err(ProtocolError::OrderViolation {
                    key: self.key,
                    expected: self.cursor + 1,
                    got: msg.seqno,
                });
            }
            self.cursor = msg.seqno;
            out.push(Delivery::from_message(msg, DeliveryOrdering::Ordered));
        }
        Ok(out)
    }

    /// Catch the cursor up with the window after OOB-only advancement.
    pub fn sync(&mut self, highest_delivered: u64) {
        self.cursor = self.cursor.max(highest_delivered);
    }
}

/// OOB pass-through.
#[derive(Debug, Default)]
pub struct UnorderedLane;

impl UnorderedLane {
    pub fn deliver(&self, msg: DataMessage) -> Delivery {
        Delivery::from_message(msg, DeliveryOrdering::Unordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageClass;

    fn key() -> WindowKey {
        WindowKey::new(MemberId::from_u128(1), Scope::Group)
    }

    fn msg(seqno: u64) -> DataMessage {
        DataMessage {
            sender: MemberId::from_u128(1),
            scope: Scope::Group,
            seqno,
            class: MessageClass::Regular,
            payload: Bytes::new(),
            stable_floor: 0,
        }
    }

    #[test]
    fn ordered_lane_advances_cursor() {
        let mut lane = OrderedLane::new(key(), 0);
        let out = lane.deliver(vec![msg(1), msg(2), msg(4)]).unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|d| d.ordering == DeliveryOrdering::Ordered));
        assert_eq!(lane.cursor(), 4);
    }

    #[test]
    fn ordered_lane_rejects_repeats() {
        let mut lane = OrderedLane::new(key(), 3);
        let err = lane.deliver(vec![msg(3)]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::OrderViolation { expected: 4, got: 3, .. }
        ));
    }

    #[test]
    fn sync_never_moves_back() {
        let mut lane = OrderedLane::new(key(), 5);
        lane.sync(2);
        assert_eq!(lane.cursor(), 5);
        lane.sync(8);
        assert_eq!(lane.cursor(), 8);
    }

    #[test]
    fn unordered_lane_tags_delivery() {
        let d = UnorderedLane.deliver(msg(9));
        assert_eq!(d.ordering, DeliveryOrdering::Unordered);
        assert_eq!(d.seqno, 9);
        assert_eq!(d.key(), key());
    }
}
