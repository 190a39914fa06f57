//! Buffering and backpressure configuration for the event bus.

use serde::{Deserialize, Serialize};

/// Default ring-buffer capacity in events.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default auto-flush interval in milliseconds.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;

/// Default consecutive-error threshold before a subscriber is quarantined.
pub const DEFAULT_ERROR_THRESHOLD: u32 = 5;

/// Fraction of the buffer reserved for critical events.
pub const DEFAULT_CRITICAL_HEADROOM: f64 = 0.1;

/// Buffer occupancy fraction that triggers an early flush.
pub const DEFAULT_HIGH_WATER_MARK: f64 = 0.8;

/// Configuration for the [`EventBus`](super::EventBus).
///
/// # Examples
///
/// ```
/// use plexus_kernel::bus::BusConfig;
///
/// // High-throughput bus: large buffer, rare flushes
/// let config = BusConfig::new(8192).with_flush_interval_ms(250);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BusConfig {
    /// Number of events the buffer can hold before shedding begins. Must be ≥ 1.
    pub buffer_size: usize,

    /// Interval between automatic flushes, in milliseconds. Must be ≥ 1.
    pub flush_interval_ms: u64,

    /// Consecutive handler errors after which a subscriber is quarantined.
    pub error_threshold: u32,

    /// Fraction of `buffer_size` reserved for critical events, in `[0, 0.5]`.
    ///
    /// Non-critical events are shed once occupancy reaches
    /// `buffer_size × (1 − critical_headroom)`; critical events may use the
    /// full buffer.
    pub critical_headroom: f64,

    /// Occupancy fraction at which a flush is triggered ahead of schedule.
    pub high_water_mark: f64,
}

impl BusConfig {
    /// Create a config with the given buffer size and defaults elsewhere.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_size` is 0.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be ≥ 1");
        Self {
            buffer_size,
            ..Default::default()
        }
    }

    /// Set the auto-flush interval.
    #[must_use]
    pub fn with_flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms.max(1);
        self
    }

    /// Set the subscriber quarantine threshold.
    #[must_use]
    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Set the critical headroom fraction (clamped to `[0, 0.5]`).
    #[must_use]
    pub fn with_critical_headroom(mut self, fraction: f64) -> Self {
        self.critical_headroom = fraction.clamp(0.0, 0.5);
        self
    }

    /// Buffer occupancy at which non-critical events start being shed.
    pub fn noncritical_capacity(&self) -> usize {
        let reserved = (self.buffer_size as f64 * self.critical_headroom).ceil() as usize;
        self.buffer_size.saturating_sub(reserved).max(1)
    }

    /// Buffer occupancy that triggers an early flush.
    pub fn high_water_slots(&self) -> usize {
        ((self.buffer_size as f64 * self.high_water_mark) as usize).max(1)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            critical_headroom: DEFAULT_CRITICAL_HEADROOM,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = BusConfig::default();
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.flush_interval_ms, DEFAULT_FLUSH_INTERVAL_MS);
        assert_eq!(config.error_threshold, DEFAULT_ERROR_THRESHOLD);
    }

    #[test]
    #[should_panic(expected = "buffer_size must be ≥ 1")]
    fn zero_buffer_panics() {
        BusConfig::new(0);
    }

    #[test]
    fn noncritical_capacity_reserves_headroom() {
        let config = BusConfig::new(100).with_critical_headroom(0.1);
        assert_eq!(config.noncritical_capacity(), 90);
    }

    #[test]
    fn headroom_is_clamped() {
        let config = BusConfig::new(100).with_critical_headroom(0.9);
        assert!((config.critical_headroom - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_keys_rejected() {
        let json = r#"{"buffer_size": 64, "bogus": true}"#;
        assert!(serde_json::from_str::<BusConfig>(json).is_err());
    }

    #[test]
    fn serialization_roundtrip() {
        let config = BusConfig::new(512).with_error_threshold(3);
        let json = serde_json::to_string(&config).unwrap();
        let back: BusConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
