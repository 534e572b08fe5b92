use crate::types::{MemberId, WindowKey};

/// Protocol-level errors for the delivery core.
///
/// Gaps and duplicates are not errors: gaps are retried and, once the retry
/// budget is spent, surfaced as an event; duplicates are counted and dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("sequence space exhausted for {key}")]
    SequenceOverflow { key: WindowKey },

    #[error("protocol violation by {member}: {reason}")]
    ProtocolViolation { member: MemberId, reason: String },

    #[error("ordered lane for {key} expected seqno {expected}, got {got}")]
    OrderViolation { key: WindowKey, expected: u64, got: u64 },

    #[error("unknown member: {member}")]
    UnknownMember { member: MemberId },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("runtime shut down")]
    RuntimeShutDown,
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scope;

    #[test]
    fn test_display_overflow() {
        let key = WindowKey::new(MemberId::from_u128(0x11), Scope::Group);
        let err = ProtocolError::SequenceOverflow { key };
        assert_eq!(err.to_string(), "sequence space exhausted for 00000011/group");
    }

    #[test]
    fn test_display_violation() {
        let err = ProtocolError::ProtocolViolation {
            member: MemberId::from_u128(0x22),
            reason: "watermark 12 above sent 10".into(),
        };
        assert_eq!(
            err.to_string(),
            "protocol violation by 00000022: watermark 12 above sent 10"
        );
    }

    #[test]
    fn test_display_shutdown() {
        assert_eq!(ProtocolError::RuntimeShutDown.to_string(), "runtime shut down");
    }
}
