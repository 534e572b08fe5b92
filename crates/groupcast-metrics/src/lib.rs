//! Small atomic statistics for the groupcast delivery stack.
//!
//! [`Counter`] only goes up by increments; [`Watermark`] only goes up by
//! being raised to a higher value. The delivery loop is the single writer,
//! anything else may sample them at any time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Shared plumbing: both types are a `u64` behind an atomic and serialize as
/// that plain number.
macro_rules! atomic_stat {
    ($name:ident) => {
        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(AtomicU64::new(value))
            }
        }

        impl Clone for $name {
            /// Snapshot; the copy evolves independently.
            fn clone(&self) -> Self {
                Self::from(self.get())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.get())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u64(self.get())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                u64::deserialize(deserializer).map(Self::from)
            }
        }
    };
}

/// Event count (duplicates dropped, requests sent, ...).
///
/// Relaxed ordering: these are statistics, never used to synchronize.
#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

atomic_stat!(Counter);

/// A value that may only move forward, such as a window's low watermark.
#[derive(Default)]
pub struct Watermark(AtomicU64);

impl Watermark {
    pub fn new(initial: u64) -> Self {
        Self::from(initial)
    }

    /// Raise to `value` if it is higher. Returns `true` if the mark moved.
    pub fn raise(&self, value: u64) -> bool {
        self.0.fetch_max(value, Ordering::AcqRel) < value
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

atomic_stat!(Watermark);
