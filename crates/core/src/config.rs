use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CADENCE__` and TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub warmup: WarmupConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Dispatch worker poll loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// In-flight contacts idle longer than this are resumed.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
    /// In-flight contacts idle longer than this are marked failed.
    #[serde(default = "default_fail_after_secs")]
    pub fail_after_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_minutes")]
    pub base_delay_minutes: i64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_minutes")]
    pub max_delay_minutes: i64,
}

/// Warmup ramp policy. The weekly ladder and safety thresholds are
/// deployment policy, not code constants.
#[derive(Debug, Clone, Deserialize)]
pub struct WarmupConfig {
    #[serde(default = "default_weekly_limits")]
    pub weekly_limits: Vec<u32>,
    #[serde(default = "default_min_days_per_week")]
    pub min_days_per_week: i64,
    #[serde(default = "default_max_bounce_rate")]
    pub max_bounce_rate: f64,
    #[serde(default = "default_max_complaint_rate")]
    pub max_complaint_rate: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Timezone whose midnight resets the daily counters.
    #[serde(default = "default_reference_timezone")]
    pub reference_timezone: String,
    /// How far ahead the scheduler searches for an open window.
    #[serde(default = "default_horizon_days")]
    pub horizon_days: i64,
}

// Default functions
fn default_node_id() -> String {
    "cadence-01".to_string()
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_send_timeout_secs() -> u64 {
    30
}
fn default_jitter_min_ms() -> u64 {
    2_000
}
fn default_jitter_max_ms() -> u64 {
    15_000
}
fn default_lease_ttl_secs() -> i64 {
    120
}
fn default_scan_interval_secs() -> u64 {
    60
}
fn default_stale_after_secs() -> i64 {
    120
}
fn default_fail_after_secs() -> i64 {
    1_800
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_minutes() -> i64 {
    15
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay_minutes() -> i64 {
    240
}
fn default_weekly_limits() -> Vec<u32> {
    vec![5, 10, 20, 40, 80, 150, 300, 500]
}
fn default_min_days_per_week() -> i64 {
    7
}
fn default_max_bounce_rate() -> f64 {
    0.05
}
fn default_max_complaint_rate() -> f64 {
    0.003
}
fn default_reference_timezone() -> String {
    "UTC".to_string()
}
fn default_horizon_days() -> i64 {
    370
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            send_timeout_secs: default_send_timeout_secs(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
            fail_after_secs: default_fail_after_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_minutes: default_base_delay_minutes(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_minutes: default_max_delay_minutes(),
        }
    }
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            weekly_limits: default_weekly_limits(),
            min_days_per_week: default_min_days_per_week(),
            max_bounce_rate: default_max_bounce_rate(),
            max_complaint_rate: default_max_complaint_rate(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            reference_timezone: default_reference_timezone(),
            horizon_days: default_horizon_days(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            worker: WorkerConfig::default(),
            recovery: RecoveryConfig::default(),
            retry: RetryConfig::default(),
            warmup: WarmupConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("CADENCE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
