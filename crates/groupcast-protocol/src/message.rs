/// Wire messages exchanged between members.
///
/// Serialized as MessagePack. Payloads are opaque to the core.
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{MemberId, MessageClass, Scope, WindowKey};

/// A sequenced application message. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    pub sender: MemberId,
    pub scope: Scope,
    pub seqno: u64,
    pub class: MessageClass,
    pub payload: Bytes,
    /// Sender's stability watermark for this scope at send time.
    ///
    /// A receiver that has never seen this stream starts its window here.
    pub stable_floor: u64,
}

impl DataMessage {
    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.sender, self.scope)
    }

    pub fn is_oob(&self) -> bool {
        self.class == MessageClass::OutOfBand
    }
}

/// One member's highest contiguously delivered seqno for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub sender: MemberId,
    pub scope: Scope,
    pub highest_delivered: u64,
    /// Reporter's low watermark for the stream. A member with no window yet
    /// opens one here.
    pub stable_floor: u64,
}

impl DigestEntry {
    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.sender, self.scope)
    }
}

/// Periodic stability report from one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityDigest {
    pub reporter: MemberId,
    pub watermarks: Vec<DigestEntry>,
}

/// Ask a member to replay `from..=to` of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetransmitRequest {
    pub requester: MemberId,
    pub sender: MemberId,
    pub scope: Scope,
    pub from: u64,
    pub to: u64,
}

impl RetransmitRequest {
    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.sender, self.scope)
    }
}

/// Everything that travels over the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Data(DataMessage),
    Digest(StabilityDigest),
    RetransmitRequest(RetransmitRequest),
}

impl Packet {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Data(_) => "data",
            Packet::Digest(_) => "digest",
            Packet::RetransmitRequest(_) => "retransmit-request",
        }
    }
}
