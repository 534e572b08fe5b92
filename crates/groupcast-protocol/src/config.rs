use std::time::Duration;

/// Tuning knobs for the delivery core and its runtime.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use groupcast_protocol::DeliveryConfig;
///
/// let config = DeliveryConfig::new()
///     .gap_timeout(Duration::from_millis(50))
///     .stability_interval(Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// How long `highest_delivered + 1` may be missing before a retransmission is requested.
    pub(crate) gap_timeout: Duration,
    /// First retry delay; doubles per attempt.
    pub(crate) backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub(crate) backoff_cap: Duration,
    /// Requests sent for one gap before it is declared persistent.
    pub(crate) max_retries: u32,
    /// Period of the stability digest exchange.
    pub(crate) stability_interval: Duration,
    /// Windows with no traffic for this long (and no gap) are evicted.
    pub(crate) idle_timeout: Duration,
    /// How often the runtime checks gaps for retransmission.
    pub(crate) retransmit_check_interval: Duration,
    /// How often the runtime looks for idle windows.
    pub(crate) idle_check_interval: Duration,
    /// Capacity of the command, delivery and event channels.
    pub(crate) channel_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            gap_timeout: Duration::from_millis(200),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(2),
            max_retries: 8,
            stability_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            retransmit_check_interval: Duration::from_millis(50),
            idle_check_interval: Duration::from_secs(30),
            channel_capacity: 1024,
        }
    }

    /// Set the gap timeout (default: 200 ms).
    pub fn gap_timeout(mut self, timeout: Duration) -> Self {
        self.gap_timeout = timeout;
        self
    }

    /// Set retransmission backoff base, cap and retry budget
    /// (defaults: 100 ms, 2 s, 8 retries).
    pub fn retransmit_backoff(mut self, base: Duration, cap: Duration, max_retries: u32) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap.max(base);
        self.max_retries = max_retries;
        self
    }

    /// Set the stability gossip interval (default: 5 s).
    pub fn stability_interval(mut self, interval: Duration) -> Self {
        self.stability_interval = interval;
        self
    }

    /// Set the idle window timeout (default: 10 min).
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set how often gaps are checked (default: 50 ms).
    pub fn retransmit_check_interval(mut self, interval: Duration) -> Self {
        self.retransmit_check_interval = interval;
        self
    }

    /// Set how often idle windows are looked for (default: 30 s).
    pub fn idle_check_interval(mut self, interval: Duration) -> Self {
        self.idle_check_interval = interval;
        self
    }

    /// Set the channel capacity (default: 1024).
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub(crate) fn gap_timeout_ms(&self) -> u64 {
        self.gap_timeout.as_millis() as u64
    }

    pub(crate) fn idle_timeout_ms(&self) -> u64 {
        self.idle_timeout.as_millis() as u64
    }

    /// Delay before retry number `attempt` (0-based): `min(base * 2^attempt, cap)`.
    pub(crate) fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.backoff_base.as_millis() as u64;
        let cap = self.backoff_cap.as_millis() as u64;
        base.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
            .min(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let config = DeliveryConfig::new().retransmit_backoff(
            Duration::from_millis(100),
            Duration::from_millis(1000),
            5,
        );
        let delays: Vec<u64> = (0..6).map(|a| config.backoff_ms(a)).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn backoff_survives_huge_attempts() {
        let config = DeliveryConfig::new();
        assert_eq!(config.backoff_ms(200), 2000);
    }

    #[test]
    fn cap_is_never_below_base() {
        let config = DeliveryConfig::new().retransmit_backoff(
            Duration::from_millis(500),
            Duration::from_millis(100),
            1,
        );
        assert_eq!(config.backoff_ms(0), 500);
    }
}
