/// Send-side bookkeeping: sequence assignment and the retransmission buffer.
///
/// Pure logic, no I/O.
use std::collections::{BTreeMap, HashMap};

use crate::error::ProtocolError;
use crate::message::DataMessage;
use crate::types::{MemberId, Scope, WindowKey};

/// Issues strictly increasing seqnos per scope of the local sender.
///
/// The multicast stream (`Scope::Group`) and every unicast destination get
/// independent counters. The first seqno of every stream is 1.
#[derive(Debug)]
pub struct SequenceAssigner {
    local_id: MemberId,
    counters: HashMap<Scope, u64>,
}

impl SequenceAssigner {
    pub fn new(local_id: MemberId) -> Self {
        Self {
            local_id,
            counters: HashMap::new(),
        }
    }

    /// Reserve the next seqno for `scope`.
    ///
    /// Overflow is fatal for the session; the counter is left untouched so
    /// the same error is returned on every later call.
    pub fn next_sequence(&mut self, scope: Scope) -> Result<u64, ProtocolError> {
        let counter = self.counters.entry(scope).or_insert(0);
        let next = counter
            .checked_add(1)
            .ok_or(ProtocolError::SequenceOverflow {
                key: WindowKey::new(self.local_id, scope),
            })?;
        *counter = next;
        Ok(next)
    }

    /// Highest seqno handed out for `scope` (0 if none).
    pub fn highest_assigned(&self, scope: &Scope) -> u64 {
        self.counters.get(scope).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn set_counter(&mut self, scope: Scope, value: u64) {
        self.counters.insert(scope, value);
    }
}

/// Sent messages of one scope, held until the group declares them stable.
#[derive(Debug, Default)]
pub struct SentBuffer {
    messages: BTreeMap<u64, DataMessage>,
    stable: u64,
}

impl SentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain a freshly sent message.
    pub fn retain(&mut self, msg: DataMessage) {
        if msg.seqno > self.stable {
            self.messages.insert(msg.seqno, msg);
        }
    }

    /// Messages still held in `from..=to`, in seqno order.
    pub fn range(&self, from: u64, to: u64) -> Vec<DataMessage> {
        if from > to {
            return Vec::new();
        }
        self.messages.range(from..=to).map(|(_, m)| m.clone()).collect()
    }

    /// Drop everything at or below `up_to`. Never moves backwards.
    ///
    /// Returns the number of messages released.
    pub fn truncate(&mut self, up_to: u64) -> usize {
        if up_to <= self.stable {
            return 0;
        }
        self.stable = up_to;
        let keep = match up_to.checked_add(1) {
            Some(next) => self.messages.split_off(&next),
            None => BTreeMap::new(),
        };
        let released = self.messages.len();
        self.messages = keep;
        released
    }

    /// Stability watermark applied so far.
    pub fn stable(&self) -> u64 {
        self.stable
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageClass;
    use bytes::Bytes;

    fn local() -> MemberId {
        MemberId::from_u128(1)
    }

    fn msg(seqno: u64) -> DataMessage {
        DataMessage {
            sender: local(),
            scope: Scope::Group,
            seqno,
            class: MessageClass::Regular,
            payload: Bytes::from(seqno.to_be_bytes().to_vec()),
            stable_floor: 0,
        }
    }

    #[test]
    fn counters_start_at_one_and_increase() {
        let mut seq = SequenceAssigner::new(local());
        assert_eq!(seq.next_sequence(Scope::Group).unwrap(), 1);
        assert_eq!(seq.next_sequence(Scope::Group).unwrap(), 2);
        assert_eq!(seq.highest_assigned(&Scope::Group), 2);
    }

    #[test]
    fn unicast_counters_are_independent() {
        let mut seq = SequenceAssigner::new(local());
        let to_b = Scope::Unicast(MemberId::from_u128(2));
        let to_c = Scope::Unicast(MemberId::from_u128(3));

        assert_eq!(seq.next_sequence(Scope::Group).unwrap(), 1);
        assert_eq!(seq.next_sequence(to_b).unwrap(), 1);
        assert_eq!(seq.next_sequence(to_b).unwrap(), 2);
        assert_eq!(seq.next_sequence(to_c).unwrap(), 1);
        assert_eq!(seq.next_sequence(Scope::Group).unwrap(), 2);
    }

    #[test]
    fn overflow_is_reported_and_sticky() {
        let mut seq = SequenceAssigner::new(local());
        seq.set_counter(Scope::Group, u64::MAX - 1);
        assert_eq!(seq.next_sequence(Scope::Group).unwrap(), u64::MAX);

        let err = seq.next_sequence(Scope::Group).unwrap_err();
        assert!(matches!(err, ProtocolError::SequenceOverflow { .. }));
        assert!(seq.next_sequence(Scope::Group).is_err());
    }

    #[test]
    fn sent_buffer_range_and_truncate() {
        let mut buf = SentBuffer::new();
        for s in 1..=5 {
            buf.retain(msg(s));
        }
        let seqnos: Vec<u64> = buf.range(2, 4).iter().map(|m| m.seqno).collect();
        assert_eq!(seqnos, vec![2, 3, 4]);

        assert_eq!(buf.truncate(3), 3);
        assert_eq!(buf.len(), 2);
        assert!(buf.range(1, 3).is_empty());

        // Lower truncation is ignored.
        assert_eq!(buf.truncate(1), 0);
        assert_eq!(buf.stable(), 3);

        // Already-stable messages are not retained again.
        buf.retain(msg(2));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn inverted_range_is_empty() {
        let mut buf = SentBuffer::new();
        buf.retain(msg(1));
        assert!(buf.range(3, 2).is_empty());
    }
}
