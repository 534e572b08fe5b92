use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a group member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub uuid::Uuid);

impl MemberId {
    /// Create a new random member identity.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Deterministic identity from a small integer (tests, simulations).
    pub fn from_u128(value: u128) -> Self {
        Self(uuid::Uuid::from_u128(value))
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell members apart in logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[s.len() - 8..])
    }
}

/// Destination class of a message.
///
/// Sequencing and receive windows are keyed by `(sender, scope)`, so a
/// sender's multicast stream and each of its unicast streams are numbered
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// The whole group (multicast).
    Group,
    /// A single destination member.
    Unicast(MemberId),
}

impl Scope {
    pub fn is_group(&self) -> bool {
        matches!(self, Scope::Group)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Group => f.write_str("group"),
            Scope::Unicast(dest) => write!(f, "unicast:{dest}"),
        }
    }
}

/// Delivery discipline requested by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageClass {
    /// Strict per-sender order, gaps block.
    Regular,
    /// Dedup only, delivered as soon as it is first seen.
    OutOfBand,
}

/// Key of a receive window / sequence stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub sender: MemberId,
    pub scope: Scope,
}

impl WindowKey {
    pub fn new(sender: MemberId, scope: Scope) -> Self {
        Self { sender, scope }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sender, self.scope)
    }
}

/// Current group membership, as reported by the membership collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub view_id: u64,
    pub members: Vec<MemberId>,
}

impl View {
    pub fn new(view_id: u64, members: Vec<MemberId>) -> Self {
        Self { view_id, members }
    }

    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
