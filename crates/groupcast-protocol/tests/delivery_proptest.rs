use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use groupcast_protocol::{
    DataMessage, DeliveryConfig, DeliveryEngine, DeliveryOrdering, EngineAction, MemberId,
    MessageClass, Packet, ReceiveWindow, Scope, View, WindowKey,
};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn id(n: u128) -> MemberId {
    MemberId::from_u128(n)
}

fn receiver() -> DeliveryEngine {
    let mut engine = DeliveryEngine::new(id(2), DeliveryConfig::default());
    engine.on_view_change(View::new(1, vec![id(1), id(2)]));
    engine
}

fn message(seqno: u64, oob: bool) -> DataMessage {
    DataMessage {
        sender: id(1),
        scope: Scope::Group,
        seqno,
        class: if oob {
            MessageClass::OutOfBand
        } else {
            MessageClass::Regular
        },
        payload: Bytes::from(seqno.to_be_bytes().to_vec()),
        stable_floor: 0,
    }
}

/// Every copy of every message, shuffled deterministically by `seed`.
fn arrivals(oob: &[bool], copies: &[usize], seed: u64) -> Vec<DataMessage> {
    let mut all = Vec::new();
    for (i, (&is_oob, &n)) in oob.iter().zip(copies).enumerate() {
        for _ in 0..n {
            all.push(message(i as u64 + 1, is_oob));
        }
    }
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    all.shuffle(&mut rng);
    all
}

fn stream() -> impl Strategy<Value = (Vec<bool>, Vec<usize>, u64)> {
    (1..40usize).prop_flat_map(|n| {
        (
            prop::collection::vec(prop::bool::weighted(0.3), n),
            prop::collection::vec(1..4usize, n),
            any::<u64>(),
        )
    })
}

proptest! {
    /// Whatever the duplication and order, each seqno reaches the
    /// application once and regular messages come out in seqno order.
    #[test]
    fn exactly_once_and_ordered((oob, copies, seed) in stream()) {
        let mut engine = receiver();
        let mut delivered = Vec::new();
        for msg in arrivals(&oob, &copies, seed) {
            for action in engine.handle_packet(id(1), Packet::Data(msg), 0) {
                if let EngineAction::Deliver(d) = action {
                    delivered.push(d);
                }
            }
        }

        let mut seen = HashSet::new();
        for d in &delivered {
            prop_assert!(seen.insert(d.seqno), "seqno {} delivered twice", d.seqno);
        }
        prop_assert_eq!(seen.len(), oob.len());

        let ordered: Vec<u64> = delivered
            .iter()
            .filter(|d| d.ordering == DeliveryOrdering::Ordered)
            .map(|d| d.seqno)
            .collect();
        prop_assert!(ordered.windows(2).all(|w| w[0] < w[1]));

        let window = engine.window(&WindowKey::new(id(1), Scope::Group)).unwrap();
        prop_assert_eq!(window.highest_delivered(), oob.len() as u64);
        prop_assert_eq!(window.buffered(), 0);
    }

    /// An OOB message is delivered by the very packet that first carries it.
    #[test]
    fn oob_is_delivered_on_first_arrival((oob, copies, seed) in stream()) {
        let mut engine = receiver();
        let mut first_seen = HashSet::new();
        for msg in arrivals(&oob, &copies, seed) {
            let seqno = msg.seqno;
            let is_oob = msg.class == MessageClass::OutOfBand;
            let first = first_seen.insert(seqno);
            let unordered: Vec<u64> = engine
                .handle_packet(id(1), Packet::Data(msg), 0)
                .into_iter()
                .filter_map(|a| match a {
                    EngineAction::Deliver(d) if d.ordering == DeliveryOrdering::Unordered => Some(d.seqno),
                    _ => None,
                })
                .collect();
            if is_oob && first {
                prop_assert_eq!(unordered, vec![seqno]);
            } else {
                prop_assert!(unordered.is_empty());
            }
        }
    }

    /// The low watermark never moves backwards and never passes
    /// `highest_delivered`, whatever mix of arrivals and truncations.
    #[test]
    fn low_watermark_is_monotone(
        ops in prop::collection::vec((any::<bool>(), 1..30u64), 1..120),
    ) {
        let key = WindowKey::new(id(1), Scope::Group);
        let mut window = ReceiveWindow::new(key, 0);
        let mut last = 0;
        for (is_truncate, value) in ops {
            if is_truncate {
                window.truncate(value);
            } else {
                window.receive(message(value, false), 0);
            }
            let low = window.low_watermark();
            prop_assert!(low >= last);
            prop_assert!(low <= window.highest_delivered());
            last = low;
        }
    }

    /// After a stability round between two members, nothing either of them
    /// still needs has been discarded: every later retransmission request
    /// for an undelivered seqno can be served.
    #[test]
    fn stability_never_discards_undelivered(
        sent in 1..20u64,
        lost in prop::collection::vec(any::<bool>(), 20),
    ) {
        let mut a = DeliveryEngine::new(id(1), DeliveryConfig::default());
        let mut b = receiver();
        a.on_view_change(View::new(1, vec![id(1), id(2)]));

        let mut outbox: HashMap<MemberId, Vec<Packet>> = HashMap::new();
        for v in 0..sent {
            let (_, actions) = a
                .send(Scope::Group, Bytes::from(v.to_be_bytes().to_vec()), MessageClass::Regular)
                .unwrap();
            for action in actions {
                if let EngineAction::Send { to, packet } = action {
                    outbox.entry(to).or_default().push(packet);
                }
            }
        }
        for packet in outbox.remove(&id(1)).unwrap_or_default() {
            a.handle_packet(id(1), packet, 0);
        }
        for (i, packet) in outbox.remove(&id(2)).unwrap_or_default().into_iter().enumerate() {
            if !lost[i] {
                b.handle_packet(id(1), packet, 0);
            }
        }

        a.stability_digest(0);
        for action in b.stability_digest(0) {
            if let EngineAction::Send { to, packet } = action {
                if to == id(1) {
                    a.handle_packet(id(2), packet, 0);
                }
            }
        }

        let key = WindowKey::new(id(1), Scope::Group);
        let b_delivered = b.window(&key).map_or(0, |w| w.highest_delivered());
        prop_assert_eq!(a.stability_watermark(&key), b_delivered);
        prop_assert_eq!(a.unstable_sent(&Scope::Group) as u64, sent - a.stability_watermark(&key));
    }
}
