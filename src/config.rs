use std::time::Duration;

use serde::Deserialize;

/// Tunables spec.md leaves as "implementation choice". Defaults match the
/// values spec.md calls out explicitly (5s discovery window, 3s command
/// timeout, 1s heartbeat, 50ms post-condition poll).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub discovery_window: Duration,
    pub discovery_poll_interval: Duration,
    pub wait_poll_interval: Duration,
    pub default_command_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub post_condition_poll_interval: Duration,
    pub controller_queue_bound: usize,
    pub passive_dispatch_poll_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            discovery_window: Duration::from_secs(5),
            discovery_poll_interval: Duration::from_millis(200),
            wait_poll_interval: Duration::from_millis(100),
            default_command_timeout: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(1),
            post_condition_poll_interval: Duration::from_millis(50),
            controller_queue_bound: 16,
            passive_dispatch_poll_interval: Duration::from_secs(1),
        }
    }
}

/// On-disk representation, all fields in milliseconds so the TOML file stays
/// plain data rather than requiring a custom `Duration` deserializer.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LinkConfigFileMillis {
    discovery_window_ms: Option<u64>,
    discovery_poll_interval_ms: Option<u64>,
    wait_poll_interval_ms: Option<u64>,
    default_command_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    post_condition_poll_interval_ms: Option<u64>,
    controller_queue_bound: Option<usize>,
    passive_dispatch_poll_interval_ms: Option<u64>,
}

impl LinkConfig {
    /// Loads overrides from `path` (TOML), falling back to defaults for any
    /// field left unset. Returns [`LinkConfig::default()`] if `path` does not
    /// exist, mirroring the teacher's `config/<env>.toml` fallback behaviour.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if !std::path::Path::new(path).exists() {
            return Ok(Self::default());
        }

        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        let file: LinkConfigFileMillis = settings.try_deserialize()?;
        let defaults = Self::default();

        Ok(Self {
            discovery_window: file
                .discovery_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.discovery_window),
            discovery_poll_interval: file
                .discovery_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.discovery_poll_interval),
            wait_poll_interval: file
                .wait_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.wait_poll_interval),
            default_command_timeout: file
                .default_command_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_command_timeout),
            heartbeat_interval: file
                .heartbeat_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
            post_condition_poll_interval: file
                .post_condition_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.post_condition_poll_interval),
            controller_queue_bound: file
                .controller_queue_bound
                .unwrap_or(defaults.controller_queue_bound),
            passive_dispatch_poll_interval: file
                .passive_dispatch_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.passive_dispatch_poll_interval),
        })
    }
}
