use crate::error::DispatchError;
use serde::Deserialize;
use std::time::Duration;

/// What `execute_request` does when every worker permit is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Fail fast with `DispatchError::Overloaded`.
    Reject,
    /// Register the request and let it wait for a worker.
    #[default]
    Queue,
}

/// What a work item does after delivering a batch that is not the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    /// Park in `MoreAvailable` until the consumer asks for more rows.
    #[default]
    Paused,
    /// Keep pulling from the connector without waiting for the consumer.
    FreeRunning,
}

/// How a work item waits when the connector reports that data is not ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotReadyPolicy {
    /// Sleep on the worker and retry in place.
    BlockingWait,
    /// Release the worker and ask the manager's scheduler to re-enqueue the item.
    #[default]
    ScheduledRetry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub default_retry_delay_ms: u64,
    #[serde(default)]
    pub request_idle_timeout_secs: Option<u64>,
    #[serde(default = "default_idle_check_interval_ms")]
    pub idle_check_interval_ms: u64,
    #[serde(default)]
    pub admission_policy: AdmissionPolicy,
    #[serde(default)]
    pub flow_control: FlowControl,
    #[serde(default)]
    pub not_ready_policy: NotReadyPolicy,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_max_concurrent_requests() -> usize {
    16
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_idle_check_interval_ms() -> u64 {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            default_retry_delay_ms: default_retry_delay_ms(),
            request_idle_timeout_secs: None,
            idle_check_interval_ms: default_idle_check_interval_ms(),
            admission_policy: AdmissionPolicy::default(),
            flow_control: FlowControl::default(),
            not_ready_policy: NotReadyPolicy::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Settings {
    /// Loads settings from the file named by `DISPATCH_CONFIG_PATH` (optional)
    /// with `IGLOO_DISPATCH__*` environment overrides.
    pub fn new() -> Result<Self, config::ConfigError> {
        let config_file_path = std::env::var("DISPATCH_CONFIG_PATH")
            .unwrap_or_else(|_| "crates/dispatch/config/default.toml".to_string());

        let s = config::Config::builder()
            .add_source(config::File::with_name(&config_file_path).required(false))
            .add_source(
                config::Environment::with_prefix("IGLOO_DISPATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        s.try_deserialize()
    }

    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_concurrent_requests == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.idle_check_interval_ms == 0 {
            return Err(DispatchError::InvalidConfig(
                "idle_check_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }

    pub fn request_idle_timeout(&self) -> Option<Duration> {
        self.request_idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.admission_policy, AdmissionPolicy::Queue);
        assert_eq!(settings.flow_control, FlowControl::Paused);
        assert_eq!(settings.not_ready_policy, NotReadyPolicy::ScheduledRetry);
        assert_eq!(settings.default_retry_delay(), Duration::from_millis(100));
        assert!(settings.request_idle_timeout().is_none());
    }

    #[test]
    fn test_loads_partial_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "max_concurrent_requests = 4\nadmission_policy = \"reject\"\nflow_control = \"free_running\"\nnot_ready_policy = \"blocking_wait\"\nrequest_idle_timeout_secs = 30"
        )
        .unwrap();

        let settings = Settings::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.max_concurrent_requests, 4);
        assert_eq!(settings.admission_policy, AdmissionPolicy::Reject);
        assert_eq!(settings.flow_control, FlowControl::FreeRunning);
        assert_eq!(settings.not_ready_policy, NotReadyPolicy::BlockingWait);
        assert_eq!(settings.request_idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(settings.default_retry_delay_ms, 100);
    }

    #[test]
    fn test_zero_pool_is_rejected() {
        let settings = Settings { max_concurrent_requests: 0, ..Default::default() };
        assert!(matches!(settings.validate(), Err(DispatchError::InvalidConfig(_))));
    }
}
