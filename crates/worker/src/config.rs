use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Directory the CSV translator resolves table names against.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
    /// Poll for files that do not exist yet instead of failing.
    #[serde(default)]
    pub await_files: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub dispatch: igloo_dispatch::Settings,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_fetch_size() -> usize {
    1024
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl WorkerSettings {
    /// Loads `path`, or the file named by `WORKER_CONFIG_PATH`, then applies
    /// `IGLOO_WORKER__*` overrides. An explicit path must exist.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let (config_file_path, required) = match path {
            Some(path) => (path.to_string(), true),
            None => (
                std::env::var("WORKER_CONFIG_PATH")
                    .unwrap_or_else(|_| "crates/worker/config/default.toml".to_string()),
                false,
            ),
        };

        let s = config::Config::builder()
            .add_source(config::File::with_name(&config_file_path).required(required))
            .add_source(
                config::Environment::with_prefix("IGLOO_WORKER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        s.try_deserialize()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use igloo_dispatch::FlowControl;

    #[test]
    fn test_nested_dispatch_settings_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(
            &path,
            "data_dir = \"/srv/csv\"\nfetch_size = 8\n\n[dispatch]\nflow_control = \"free_running\"\n",
        )
        .unwrap();

        let settings = WorkerSettings::load(path.to_str()).unwrap();

        assert_eq!(settings.data_dir, PathBuf::from("/srv/csv"));
        assert_eq!(settings.fetch_size, 8);
        assert!(!settings.await_files);
        assert_eq!(settings.poll_interval(), Duration::from_millis(500));
        assert_eq!(settings.dispatch.flow_control, FlowControl::FreeRunning);
        assert_eq!(settings.dispatch.max_concurrent_requests, 16);
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        assert!(WorkerSettings::load(Some("/definitely/not/here/worker.toml")).is_err());
    }
}
