//! Unified typed configuration for the core.
//!
//! One [`CoreConfig`] struct with named sections replaces loose option bags.
//! Every section uses `deny_unknown_fields`, so a misspelled or unsupported
//! option is rejected at parse time rather than silently ignored. Presets
//! bundle sensible defaults per environment; load one, then override fields.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::BusConfig;
use crate::executor::ExecutorConfig;
use crate::timeline::TimelineConfig;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Configuration parse/validation errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Config parsing error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Result type for config operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Deployment environment; selects preset defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

/// Log verbosity, mirroring the standard level ladder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
    Silent,
}

impl LogLevel {
    /// Directive string for `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Fatal | LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
            LogLevel::Silent => "off",
        }
    }
}

/// Logger section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggerConfig {
    pub level: LogLevel,
    /// Human-readable output instead of JSON lines.
    pub pretty_print: bool,
    /// Field names scrubbed from log output.
    pub redact: Vec<String>,
}

/// Telemetry section (consumed by the monitoring crate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub service_name: String,
    /// Probability of sampling a trace, in `[0, 1]`.
    pub sampling_rate: f64,
    pub features: TelemetryFeatures,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "plexus".into(),
            sampling_rate: 1.0,
            features: TelemetryFeatures::default(),
        }
    }
}

/// Fine-grained telemetry switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TelemetryFeatures {
    pub trace_events: bool,
    pub trace_kernel: bool,
    pub trace_snapshots: bool,
    pub trace_persistence: bool,
    pub metrics_enabled: bool,
}

impl Default for TelemetryFeatures {
    fn default() -> Self {
        Self {
            trace_events: true,
            trace_kernel: true,
            trace_snapshots: false,
            trace_persistence: false,
            metrics_enabled: true,
        }
    }
}

/// Leak-detector thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LeakThresholds {
    pub memory_growth_mb: f64,
    pub max_active_timers: usize,
    pub max_pending_tasks: usize,
    pub max_heap_usage_percent: f64,
    pub max_listeners_per_object: usize,
}

impl Default for LeakThresholds {
    fn default() -> Self {
        Self {
            memory_growth_mb: 100.0,
            max_active_timers: 100,
            max_pending_tasks: 500,
            max_heap_usage_percent: 85.0,
            max_listeners_per_object: 20,
        }
    }
}

/// Auto-cleanup behavior of the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AutoCleanupConfig {
    pub enabled: bool,
    /// Resources older than this are disposed by the sweep, in milliseconds.
    pub max_resource_age_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Hint the allocator after a sweep.
    pub force_gc: bool,
}

impl Default for AutoCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_resource_age_ms: 300_000,
            cleanup_interval_ms: 60_000,
            force_gc: false,
        }
    }
}

/// Leak-detector section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LeakDetectorConfig {
    pub enabled: bool,
    /// Probe interval, in milliseconds.
    pub monitoring_interval_ms: u64,
    pub thresholds: LeakThresholds,
    pub auto_cleanup: AutoCleanupConfig,
}

impl Default for LeakDetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            monitoring_interval_ms: 30_000,
            thresholds: LeakThresholds::default(),
            auto_cleanup: AutoCleanupConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// CoreConfig
// ---------------------------------------------------------------------------

/// Top-level configuration with one section per subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
    pub environment: Environment,
    pub logger: LoggerConfig,
    pub event_bus: BusConfig,
    pub telemetry: TelemetryConfig,
    pub timeline: TimelineConfig,
    pub scheduler: ExecutorConfig,
    pub leak_detector: LeakDetectorConfig,
}

impl CoreConfig {
    /// Parse from JSON, rejecting unknown options, then validate ranges.
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks beyond what the type system enforces.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.event_bus.buffer_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_bus.buffer_size".into(),
                reason: "must be > 0".into(),
            });
        }
        if self.event_bus.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_bus.flush_interval_ms".into(),
                reason: "must be > 0".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.telemetry.sampling_rate) {
            return Err(ConfigError::InvalidValue {
                field: "telemetry.sampling_rate".into(),
                reason: "must be within [0, 1]".into(),
            });
        }
        if self.scheduler.max_parallel_steps == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.max_parallel_steps".into(),
                reason: "must be > 0".into(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Presets
    // -----------------------------------------------------------------------

    /// Development preset: verbose logs, tight leak thresholds, short
    /// intervals.
    pub fn development() -> Self {
        let mut config = Self {
            environment: Environment::Development,
            ..Default::default()
        };
        config.logger.level = LogLevel::Debug;
        config.logger.pretty_print = true;
        config.leak_detector.monitoring_interval_ms = 10_000;
        config.leak_detector.thresholds.memory_growth_mb = 50.0;
        config.leak_detector.thresholds.max_active_timers = 50;
        config
    }

    /// Production preset: info logs, relaxed thresholds, longer intervals.
    pub fn production() -> Self {
        let mut config = Self {
            environment: Environment::Production,
            ..Default::default()
        };
        config.logger.level = LogLevel::Info;
        config.telemetry.sampling_rate = 0.1;
        config.leak_detector.monitoring_interval_ms = 60_000;
        config.leak_detector.thresholds.memory_growth_mb = 250.0;
        config.leak_detector.thresholds.max_active_timers = 500;
        config.leak_detector.auto_cleanup.cleanup_interval_ms = 300_000;
        config
    }

    /// Test preset: silent logs, timeline strictness, tiny intervals.
    pub fn test() -> Self {
        let mut config = Self {
            environment: Environment::Test,
            ..Default::default()
        };
        config.logger.level = LogLevel::Silent;
        config.timeline.strict = false;
        config.event_bus.flush_interval_ms = 10;
        config.leak_detector.enabled = false;
        config
    }

    /// High-performance preset: bigger buffers, lower sampling.
    pub fn high_performance() -> Self {
        let mut config = Self::production();
        config.event_bus.buffer_size = 8_192;
        config.event_bus.flush_interval_ms = 250;
        config.telemetry.sampling_rate = 0.01;
        config.scheduler.max_parallel_steps = 16;
        config
    }

    /// Minimal preset: telemetry and timeline off.
    pub fn minimal() -> Self {
        let mut config = Self::default();
        config.telemetry.enabled = false;
        config.telemetry.features = TelemetryFeatures {
            trace_events: false,
            trace_kernel: false,
            trace_snapshots: false,
            trace_persistence: false,
            metrics_enabled: false,
        };
        config.timeline.enabled = false;
        config.leak_detector.enabled = false;
        config
    }

    /// Debug preset: everything on, pretty logs.
    pub fn debug() -> Self {
        let mut config = Self::development();
        config.logger.level = LogLevel::Trace;
        config.telemetry.features = TelemetryFeatures {
            trace_events: true,
            trace_kernel: true,
            trace_snapshots: true,
            trace_persistence: true,
            metrics_enabled: true,
        };
        config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
