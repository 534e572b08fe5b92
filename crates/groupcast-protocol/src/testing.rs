//! Fault injection for tests and the stress runner.
//!
//! `FaultyTransport` wraps any [`Transport`] and makes the network as
//! unpleasant as asked: every packet sent or received can be copied,
//! dropped, or held back and released out of order. All randomness comes
//! from a seeded `StdRng`, so a failing run can be replayed.
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::runtime::Transport;
use crate::types::MemberId;

/// What the faulty network does to traffic.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Copies put on the wire for every send (0 behaves like a black hole).
    pub outgoing_copies: usize,
    /// Copies handed up for every packet received.
    pub incoming_copies: usize,
    /// Probability that an outgoing copy is lost.
    pub drop_rate: f64,
    /// Hold up to this many inbound packets and release them in random order.
    pub reorder_window: usize,
    /// How long to wait for more traffic before releasing a held packet.
    pub reorder_delay: Duration,
    pub seed: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            outgoing_copies: 1,
            incoming_copies: 1,
            drop_rate: 0.0,
            reorder_window: 0,
            reorder_delay: Duration::from_millis(2),
            seed: 0,
        }
    }
}

impl FaultConfig {
    /// Duplicate on both sides, the way the classic "duplicating network"
    /// scenarios stress the filter.
    pub fn duplicating(outgoing: usize, incoming: usize) -> Self {
        Self {
            outgoing_copies: outgoing,
            incoming_copies: incoming,
            ..Self::default()
        }
    }

    pub fn drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn reorder(mut self, window: usize) -> Self {
        self.reorder_window = window;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Transport wrapper that duplicates, drops and reorders.
pub struct FaultyTransport<T> {
    inner: T,
    faults: FaultConfig,
    rng: Mutex<StdRng>,
    held: VecDeque<(MemberId, Vec<u8>)>,
}

impl<T: Transport> FaultyTransport<T> {
    pub fn new(inner: T, faults: FaultConfig) -> Self {
        let rng = StdRng::seed_from_u64(faults.seed);
        Self {
            inner,
            faults,
            rng: Mutex::new(rng),
            held: VecDeque::new(),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn rng(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick the next held packet: FIFO, or random when reordering.
    fn release(&mut self) -> Option<(MemberId, Vec<u8>)> {
        if self.faults.reorder_window == 0 || self.held.len() < 2 {
            return self.held.pop_front();
        }
        let index = self.rng().random_range(0..self.held.len());
        self.held.remove(index)
    }

    fn hold(&mut self, from: MemberId, data: Vec<u8>) {
        for _ in 0..self.faults.incoming_copies {
            self.held.push_back((from, data.clone()));
        }
    }
}

#[async_trait::async_trait]
impl<T: Transport> Transport for FaultyTransport<T> {
    async fn send_raw(&self, target: MemberId, data: &[u8]) -> Result<(), String> {
        // Decide before awaiting; the rng guard must not cross an await.
        let survivors = {
            let mut rng = self.rng();
            (0..self.faults.outgoing_copies)
                .filter(|_| self.faults.drop_rate <= 0.0 || !rng.random_bool(self.faults.drop_rate))
                .count()
        };
        if survivors < self.faults.outgoing_copies {
            tracing::trace!(
                to = %target,
                dropped = self.faults.outgoing_copies - survivors,
                "fault injection dropped copies"
            );
        }
        for _ in 0..survivors {
            self.inner.send_raw(target, data).await?;
        }
        Ok(())
    }

    async fn recv_raw(&mut self) -> Result<(MemberId, Vec<u8>), String> {
        loop {
            let window_full = self.held.len() > self.faults.reorder_window;
            if !self.held.is_empty() && (self.faults.reorder_window == 0 || window_full) {
                if let Some(packet) = self.release() {
                    return Ok(packet);
                }
            }

            if self.held.is_empty() {
                let (from, data) = self.inner.recv_raw().await?;
                self.hold(from, data);
                continue;
            }

            // Reordering with a partly filled window: wait briefly for more
            // traffic, then release whatever is held.
            match tokio::time::timeout(self.faults.reorder_delay, self.inner.recv_raw()).await {
                Ok(result) => {
                    let (from, data) = result?;
                    self.hold(from, data);
                }
                Err(_) => {
                    if let Some(packet) = self.release() {
                        return Ok(packet);
                    }
                }
            }
        }
    }
}
