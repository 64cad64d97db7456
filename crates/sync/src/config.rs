//! Engine configuration.

use std::time::Duration;

/// Configuration for the offline sync engine.
///
/// The three recognized consumer-facing options are
/// `enable_optimistic_updates`, `max_retries` and `sync_interval`; the rest
/// are operational knobs with conservative defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Apply queued mutations to the local read model before confirmation.
    pub enable_optimistic_updates: bool,
    /// Total transient attempts per action before it is marked failed.
    pub max_retries: u32,
    /// Periodic sync cadence while online.
    pub sync_interval: Duration,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub backoff_max: Duration,
    /// Reachability probe cadence.
    pub probe_interval: Duration,
    /// How long a connectivity loss must persist before it is reported.
    pub offline_grace: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enable_optimistic_updates: true,
            max_retries: 3,
            sync_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            probe_interval: Duration::from_secs(10),
            offline_grace: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    pub fn with_optimistic_updates(mut self, enabled: bool) -> Self {
        self.enable_optimistic_updates = enabled;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_offline_grace(mut self, grace: Duration) -> Self {
        self.offline_grace = grace;
        self
    }

    /// Exponential backoff delay before the next attempt.
    ///
    /// `attempts` is the number of attempts already made (1-indexed at the
    /// first failure). Doubles per attempt, capped at `backoff_max`.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let base_ms = self.backoff_base.as_millis() as u64;
        let max_ms = self.backoff_max.as_millis() as u64;
        let exp = attempts.saturating_sub(1).min(31);
        let delay_ms = base_ms.saturating_mul(1u64 << exp).min(max_ms);
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = SyncConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let config = SyncConfig::default()
            .with_backoff(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(config.backoff_delay(10), Duration::from_secs(5));
        // Huge attempt counts must not overflow the shift.
        assert_eq!(config.backoff_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn defaults_match_the_recognized_options() {
        let config = SyncConfig::default();
        assert!(config.enable_optimistic_updates);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.sync_interval, Duration::from_secs(30));
    }
}
