/// DeliveryEngine: one member's complete delivery state.
///
/// Pure state machine: feed it sends, inbound packets, view changes and
/// timer ticks; it returns `Vec<EngineAction>` for the caller to execute.
/// Owns every receive window of this member in an explicit map keyed by
/// `(sender, scope)`. Windows are created lazily on first arrival and
/// dropped on view change or after going idle.
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use bytes::Bytes;
use groupcast_metrics::Counter;
use serde::Serialize;

use crate::config::DeliveryConfig;
use crate::error::ProtocolError;
use crate::lanes::{Delivery, OrderedLane, UnorderedLane};
use crate::message::{DataMessage, DigestEntry, Packet, RetransmitRequest, StabilityDigest};
use crate::outbound::{SentBuffer, SequenceAssigner};
use crate::retransmit::{GapAction, RetransmitRequester};
use crate::stability::StabilityTracker;
use crate::types::{MemberId, MessageClass, Scope, View, WindowKey};
use crate::window::{ReceiveWindow, Receipt};

// ── Actions & events ─────────────────────────────────────────────────────

/// Something the engine wants the runtime to do.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    /// Put a packet on the wire to one member.
    Send { to: MemberId, packet: Packet },
    /// Hand a message to the application.
    Deliver(Delivery),
    /// Report something noteworthy upward.
    Event(ProtocolEvent),
}

/// Notifications for the application / operator. None of them are fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// A gap survived every retransmission attempt; ordered delivery for
    /// the stream stays stalled.
    PersistentGap {
        key: WindowKey,
        from: u64,
        to: u64,
        attempts: u32,
    },
    /// A member reported something it cannot have received.
    PeerFaulty { member: MemberId, reason: String },
    /// History of a stream up to `watermark` was discarded everywhere locally.
    StabilityAdvanced { key: WindowKey, watermark: u64 },
    /// An idle window was dropped.
    WindowEvicted { key: WindowKey, highest_delivered: u64 },
    /// A new view was installed.
    ViewInstalled { view_id: u64, departed: Vec<MemberId> },
    /// Non-fatal runtime error (transport, decoding).
    Error { description: String },
}

// ── Stats ────────────────────────────────────────────────────────────────

/// Monotonic counters, for observability only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Counters {
    pub sent: Counter,
    pub delivered_ordered: Counter,
    pub delivered_unordered: Counter,
    pub duplicates: Counter,
    pub stale: Counter,
    pub non_member_dropped: Counter,
    pub retransmit_requests_sent: Counter,
    pub retransmit_requests_served: Counter,
    pub messages_replayed: Counter,
    pub persistent_gaps: Counter,
    pub digests_received: Counter,
    pub windows_evicted: Counter,
    pub decode_errors: Counter,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub member: String,
    pub view_id: u64,
    pub windows: usize,
    pub open_gaps: usize,
    pub buffered_out_of_order: usize,
    pub retained_for_peers: usize,
    pub unstable_sent: usize,
    pub tombstones: usize,
    pub counters: Counters,
}

// ── Engine ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Stream {
    window: ReceiveWindow,
    lane: OrderedLane,
}

impl Stream {
    fn new(window: ReceiveWindow) -> Self {
        let lane = OrderedLane::new(window.key(), window.highest_delivered());
        Self { window, lane }
    }
}

/// One member's delivery core.
#[derive(Debug)]
pub struct DeliveryEngine {
    local_id: MemberId,
    config: DeliveryConfig,
    view: View,
    sequencer: SequenceAssigner,
    sent: HashMap<Scope, SentBuffer>,
    streams: HashMap<WindowKey, Stream>,
    /// `highest_delivered` of idle windows evicted before that point was
    /// stable, so a re-created window never re-delivers. Released once
    /// stability catches up.
    tombstones: HashMap<WindowKey, u64>,
    unordered: UnorderedLane,
    requester: RetransmitRequester,
    stability: StabilityTracker,
    counters: Counters,
}

impl DeliveryEngine {
    /// Engine for `local_id`, alone in view 0 until the first view change.
    pub fn new(local_id: MemberId, config: DeliveryConfig) -> Self {
        let view = View::new(0, vec![local_id]);
        Self {
            local_id,
            config,
            view: view.clone(),
            sequencer: SequenceAssigner::new(local_id),
            sent: HashMap::new(),
            streams: HashMap::new(),
            tombstones: HashMap::new(),
            unordered: UnorderedLane,
            requester: RetransmitRequester::new(),
            stability: StabilityTracker::new(local_id, view),
            counters: Counters::default(),
        }
    }

    pub fn local_id(&self) -> MemberId {
        self.local_id
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    /// Receive window for `key`, if one exists.
    pub fn window(&self, key: &WindowKey) -> Option<&ReceiveWindow> {
        self.streams.get(key).map(|s| &s.window)
    }

    /// Sent messages of `scope` still held for retransmission.
    pub fn unstable_sent(&self, scope: &Scope) -> usize {
        self.sent.get(scope).map_or(0, SentBuffer::len)
    }

    /// Stability watermark applied so far for `key`.
    pub fn stability_watermark(&self, key: &WindowKey) -> u64 {
        self.stability.watermark(key)
    }

    // ── Send path ────────────────────────────────────────────────────

    /// Sequence and emit a message. Returns the assigned seqno.
    ///
    /// Multicast goes to every view member, the local one included.
    pub fn send(
        &mut self,
        scope: Scope,
        payload: Bytes,
        class: MessageClass,
    ) -> Result<(u64, Vec<EngineAction>), ProtocolError> {
        let targets = match scope {
            Scope::Group => self.view.members.clone(),
            Scope::Unicast(dest) => {
                if dest != self.local_id && !self.view.contains(&dest) {
                    return Err(ProtocolError::UnknownMember { member: dest });
                }
                vec![dest]
            }
        };

        let seqno = self.sequencer.next_sequence(scope)?;
        let buffer = self.sent.entry(scope).or_default();
        let msg = DataMessage {
            sender: self.local_id,
            scope,
            seqno,
            class,
            payload,
            stable_floor: buffer.stable(),
        };
        buffer.retain(msg.clone());
        self.counters.sent.inc();

        tracing::trace!(scope = %scope, seqno, ?class, "send");

        let actions = targets
            .into_iter()
            .map(|to| EngineAction::Send {
                to,
                packet: Packet::Data(msg.clone()),
            })
            .collect();
        Ok((seqno, actions))
    }

    // ── Receive path ─────────────────────────────────────────────────

    /// Process one inbound packet (any copy, including duplicates).
    pub fn handle_packet(&mut self, from: MemberId, packet: Packet, now_ms: u64) -> Vec<EngineAction> {
        match packet {
            Packet::Data(msg) => self.handle_data(msg, now_ms),
            Packet::Digest(digest) => self.handle_digest(from, digest, now_ms),
            Packet::RetransmitRequest(req) => self.handle_retransmit_request(req),
        }
    }

    fn handle_data(&mut self, msg: DataMessage, now_ms: u64) -> Vec<EngineAction> {
        if msg.sender != self.local_id && !self.view.contains(&msg.sender) {
            self.counters.non_member_dropped.inc();
            tracing::debug!(sender = %msg.sender, seqno = msg.seqno, "data from non-member dropped");
            return vec![];
        }
        if let Scope::Unicast(dest) = msg.scope {
            if dest != self.local_id {
                tracing::debug!(sender = %msg.sender, dest = %dest, "misrouted unicast dropped");
                return vec![];
            }
        }

        let key = msg.key();
        let tombstones = &mut self.tombstones;
        let stable_floor = msg.stable_floor.max(self.stability.watermark(&key));
        let stream = self.streams.entry(key).or_insert_with(|| {
            let floor = stable_floor.max(tombstones.remove(&key).unwrap_or(0));
            tracing::debug!(key = %key, floor, "opening receive window");
            Stream::new(ReceiveWindow::starting_at(key, floor, now_ms))
        });

        let mut actions = Vec::new();
        match stream.window.receive(msg, now_ms) {
            Receipt::Duplicate => {
                self.counters.duplicates.inc();
                return actions;
            }
            Receipt::Stale => {
                self.counters.stale.inc();
                return actions;
            }
            Receipt::Accepted { unordered, ordered } => {
                if let Some(msg) = unordered {
                    self.counters.delivered_unordered.inc();
                    actions.push(EngineAction::Deliver(self.unordered.deliver(msg)));
                }
                match stream.lane.deliver(ordered) {
                    Ok(deliveries) => {
                        self.counters.delivered_ordered.inc_by(deliveries.len() as u64);
                        actions.extend(deliveries.into_iter().map(EngineAction::Deliver));
                    }
                    Err(e) => {
                        tracing::error!(key = %key, "ordered lane rejected run: {e}");
                        actions.push(EngineAction::Event(ProtocolEvent::Error {
                            description: e.to_string(),
                        }));
                    }
                }
                stream.lane.sync(stream.window.highest_delivered());
            }
        }

        let missing = stream.window.missing();
        self.requester.observe(key, missing, now_ms, &self.config);
        actions
    }

    fn handle_digest(
        &mut self,
        from: MemberId,
        digest: StabilityDigest,
        now_ms: u64,
    ) -> Vec<EngineAction> {
        if from != digest.reporter {
            tracing::debug!(from = %from, reporter = %digest.reporter, "relayed digest");
        }
        self.counters.digests_received.inc();

        let mut actions = Vec::new();
        if let Err(e) = self.stability.record(&digest, &self.sequencer) {
            tracing::warn!(reporter = %digest.reporter, "{e}; ignoring member until next view");
            actions.push(EngineAction::Event(ProtocolEvent::PeerFaulty {
                member: digest.reporter,
                reason: e.to_string(),
            }));
        } else if self.view.contains(&digest.reporter) && !self.stability.is_faulty(&digest.reporter) {
            self.note_stream_progress(&digest, now_ms);
            actions.extend(self.push_unicast_tail(&digest));
        }
        actions.extend(self.apply_stability());
        actions
    }

    /// A peer's report on a group stream tells us how far that stream got,
    /// which exposes messages lost at its tail. A stream we never heard from
    /// at all gets its window here, starting at the reporter's floor.
    fn note_stream_progress(&mut self, digest: &StabilityDigest, now_ms: u64) {
        for entry in &digest.watermarks {
            if !entry.scope.is_group()
                || entry.sender == self.local_id
                || !self.view.contains(&entry.sender)
            {
                continue;
            }
            let key = entry.key();
            let stream = match self.streams.entry(key) {
                Entry::Occupied(occupied) => occupied.into_mut(),
                Entry::Vacant(vacant) => {
                    let floor = entry
                        .stable_floor
                        .max(self.stability.watermark(&key))
                        .max(self.tombstones.get(&key).copied().unwrap_or(0));
                    if entry.highest_delivered <= floor {
                        continue;
                    }
                    self.tombstones.remove(&key);
                    tracing::debug!(
                        key = %key,
                        floor,
                        reported = entry.highest_delivered,
                        reporter = %digest.reporter,
                        "opening receive window from digest"
                    );
                    vacant.insert(Stream::new(ReceiveWindow::starting_at(key, floor, now_ms)))
                }
            };
            if entry.highest_delivered > stream.window.highest_delivered() {
                stream.window.hint_highest(entry.highest_delivered);
                self.requester.observe(key, stream.window.missing(), now_ms, &self.config);
            }
        }
    }

    /// Unicast streams have no third party to hint the tail, so the sender
    /// pushes whatever the destination reports it has not delivered yet.
    /// No entry at all means the destination has seen nothing above what is
    /// already stable.
    fn push_unicast_tail(&mut self, digest: &StabilityDigest) -> Vec<EngineAction> {
        let scope = Scope::Unicast(digest.reporter);
        let last = self.sequencer.highest_assigned(&scope);
        let Some(buffer) = self.sent.get(&scope) else {
            return Vec::new();
        };
        let delivered = digest
            .watermarks
            .iter()
            .find(|e| e.sender == self.local_id && e.scope == scope)
            .map_or(buffer.stable(), |e| e.highest_delivered.max(buffer.stable()));
        if delivered >= last {
            return Vec::new();
        }
        let replay = buffer.range(delivered + 1, last);
        if !replay.is_empty() {
            tracing::debug!(
                to = %digest.reporter,
                from = delivered + 1,
                to_seqno = last,
                "pushing unicast tail"
            );
        }
        self.counters.messages_replayed.inc_by(replay.len() as u64);
        replay
            .into_iter()
            .map(|msg| EngineAction::Send {
                to: digest.reporter,
                packet: Packet::Data(msg),
            })
            .collect()
    }

    fn handle_retransmit_request(&mut self, req: RetransmitRequest) -> Vec<EngineAction> {
        if !self.view.contains(&req.requester) {
            return vec![];
        }
        let key = req.key();
        let replay = if req.sender == self.local_id {
            self.sent
                .get(&req.scope)
                .map(|buf| buf.range(req.from, req.to))
                .unwrap_or_default()
        } else if req.scope.is_group() {
            self.streams
                .get(&key)
                .map(|s| s.window.retained_range(req.from, req.to))
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        self.counters.retransmit_requests_served.inc();
        tracing::debug!(
            key = %key,
            requester = %req.requester,
            from = req.from,
            to = req.to,
            replayed = replay.len(),
            "serving retransmission"
        );
        self.counters.messages_replayed.inc_by(replay.len() as u64);
        replay
            .into_iter()
            .map(|msg| EngineAction::Send {
                to: req.requester,
                packet: Packet::Data(msg),
            })
            .collect()
    }

    /// Count an inbound packet that failed to decode.
    pub fn record_decode_error(&self) {
        self.counters.decode_errors.inc();
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Issue due retransmission requests and report exhausted gaps.
    pub fn tick_retransmit(&mut self, now_ms: u64) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for gap in self.requester.poll(now_ms, &self.config) {
            match gap {
                GapAction::Request { key, from, to, attempt } => {
                    let target = self.retransmit_target(&key, attempt);
                    tracing::debug!(key = %key, from, to, attempt, target = %target, "requesting retransmission");
                    self.counters.retransmit_requests_sent.inc();
                    actions.push(EngineAction::Send {
                        to: target,
                        packet: Packet::RetransmitRequest(RetransmitRequest {
                            requester: self.local_id,
                            sender: key.sender,
                            scope: key.scope,
                            from,
                            to,
                        }),
                    });
                }
                GapAction::Persistent { key, from, to, attempts } => {
                    tracing::warn!(key = %key, from, to, attempts, "persistent gap, ordered delivery stalled");
                    self.counters.persistent_gaps.inc();
                    actions.push(EngineAction::Event(ProtocolEvent::PersistentGap {
                        key,
                        from,
                        to,
                        attempts,
                    }));
                }
            }
        }
        actions
    }

    /// First attempt goes to the original sender; later attempts on group
    /// streams rotate through the other members, which serve from their
    /// retained windows.
    fn retransmit_target(&self, key: &WindowKey, attempt: u32) -> MemberId {
        if !key.scope.is_group() || attempt <= 1 {
            return key.sender;
        }
        let mut candidates = vec![key.sender];
        candidates.extend(
            self.view
                .members
                .iter()
                .copied()
                .filter(|m| *m != self.local_id && *m != key.sender),
        );
        candidates[(attempt as usize - 1) % candidates.len()]
    }

    /// Build this member's digest, record it locally and address it to
    /// every other member. Also applies any stability it unlocks.
    pub fn stability_digest(&mut self, now_ms: u64) -> Vec<EngineAction> {
        // Our own multicast copies can be lost on the way back to us too.
        let own = WindowKey::new(self.local_id, Scope::Group);
        let last_sent = self.sequencer.highest_assigned(&Scope::Group);
        if last_sent > 0 && !self.streams.contains_key(&own) {
            // Every loopback copy so far was lost.
            let stable = self.sent.get(&Scope::Group).map_or(0, SentBuffer::stable);
            let floor = stable.max(self.tombstones.get(&own).copied().unwrap_or(0));
            if last_sent > floor {
                self.tombstones.remove(&own);
                let window = ReceiveWindow::starting_at(own, floor, now_ms);
                self.streams.insert(own, Stream::new(window));
            }
        }
        if let Some(stream) = self.streams.get_mut(&own) {
            if last_sent > stream.window.highest_delivered() {
                stream.window.hint_highest(last_sent);
                self.requester.observe(own, stream.window.missing(), now_ms, &self.config);
            }
        }

        let mut watermarks: Vec<DigestEntry> = self
            .streams
            .iter()
            .map(|(key, stream)| DigestEntry {
                sender: key.sender,
                scope: key.scope,
                highest_delivered: stream.window.highest_delivered(),
                stable_floor: stream.window.low_watermark(),
            })
            .collect();
        watermarks.sort_by_key(|e| e.key());
        let digest = StabilityDigest {
            reporter: self.local_id,
            watermarks,
        };

        let mut actions = Vec::new();
        if let Err(e) = self.stability.record(&digest, &self.sequencer) {
            // Our own windows never run ahead of our own sequencer.
            tracing::error!("local digest rejected: {e}");
        }
        actions.extend(self.apply_stability());
        actions.extend(self.push_unicast_tail(&digest));

        for member in &self.view.members {
            if *member == self.local_id {
                continue;
            }
            actions.push(EngineAction::Send {
                to: *member,
                packet: Packet::Digest(digest.clone()),
            });
        }
        actions
    }

    fn apply_stability(&mut self) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for (key, watermark) in self.stability.evaluate() {
            let mut released = 0;
            if key.sender == self.local_id {
                if let Some(buffer) = self.sent.get_mut(&key.scope) {
                    released = buffer.truncate(watermark);
                }
            }
            if let Some(stream) = self.streams.get_mut(&key) {
                stream.window.truncate(watermark);
            }
            if self.tombstones.get(&key).is_some_and(|floor| *floor <= watermark) {
                self.tombstones.remove(&key);
            }
            tracing::debug!(key = %key, watermark, released, "stability advanced");
            actions.push(EngineAction::Event(ProtocolEvent::StabilityAdvanced { key, watermark }));
        }
        actions
    }

    /// Drop windows that have been quiet for `idle_timeout`.
    ///
    /// A window whose history is already stable leaves nothing behind: the
    /// stability watermark keeps late copies stale. Otherwise a tombstone
    /// holds its floor until stability reaches it.
    pub fn tick_idle(&mut self, now_ms: u64) -> Vec<EngineAction> {
        let idle_ms = self.config.idle_timeout_ms();
        let idle: Vec<WindowKey> = self
            .streams
            .iter()
            .filter(|(_, s)| s.window.is_idle(now_ms, idle_ms))
            .map(|(key, _)| *key)
            .collect();

        let mut actions = Vec::new();
        for key in idle {
            let Some(stream) = self.streams.remove(&key) else {
                continue;
            };
            let highest_delivered = stream.window.highest_delivered();
            if highest_delivered > self.stability.watermark(&key) {
                self.tombstones.insert(key, highest_delivered);
            }
            self.requester.forget(&key);
            self.counters.windows_evicted.inc();
            tracing::debug!(key = %key, highest_delivered, "evicted idle window");
            actions.push(EngineAction::Event(ProtocolEvent::WindowEvicted {
                key,
                highest_delivered,
            }));
        }
        actions
    }

    // ── Membership ───────────────────────────────────────────────────

    /// Install a new view. Everything belonging to departed members is torn
    /// down at once; no delivery for them happens after this returns.
    pub fn on_view_change(&mut self, view: View) -> Vec<EngineAction> {
        let departed: Vec<MemberId> = self
            .view
            .members
            .iter()
            .copied()
            .filter(|m| !view.contains(m) && *m != self.local_id)
            .collect();

        for member in &departed {
            self.streams.retain(|key, _| key.sender != *member);
            self.tombstones.retain(|key, _| key.sender != *member);
            self.requester.forget_sender(member);
            self.sent.remove(&Scope::Unicast(*member));
        }

        tracing::info!(
            member = %self.local_id,
            view_id = view.view_id,
            size = view.len(),
            departed = departed.len(),
            "installing view"
        );
        self.stability.install_view(view.clone());
        self.view = view;

        let mut actions = vec![EngineAction::Event(ProtocolEvent::ViewInstalled {
            view_id: self.view.view_id,
            departed,
        })];
        actions.extend(self.apply_stability());
        actions
    }

    // ── Stats ────────────────────────────────────────────────────────

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            member: self.local_id.to_string(),
            view_id: self.view.view_id,
            windows: self.streams.len(),
            open_gaps: self.requester.len(),
            buffered_out_of_order: self.streams.values().map(|s| s.window.buffered()).sum(),
            retained_for_peers: self.streams.values().map(|s| s.window.retained()).sum(),
            unstable_sent: self.sent.values().map(SentBuffer::len).sum(),
            tombstones: self.tombstones.len(),
            counters: self.counters.clone(),
        }
    }
}
