use clap::Parser;
use lib_pipeline::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Resilient pipeline demo over a simulated flaky transport", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PIPELINE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PIPELINE_LOG_DIR", help = "Directory for the log file. Stdout only when unset.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PIPELINE_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PIPELINE_ADDRESS", help = "Address handed to the simulated dialer.")]
    pub address: Option<String>,

    #[clap(long, env = "PIPELINE_FETCH_INTERVAL_MS", help = "Milliseconds between producer fetches.")]
    pub fetch_interval_ms: Option<u64>,

    #[clap(long, env = "PIPELINE_BATCH_SIZE", help = "Items produced per fetch.")]
    pub batch_size: Option<u64>,

    #[clap(long, env = "PIPELINE_WORKERS", help = "Number of consumer workers.")]
    pub workers: Option<usize>,

    #[clap(long, env = "PIPELINE_RUN_SECONDS", help = "Seconds to run before shutting down (0 waits for Ctrl-C).")]
    pub run_seconds: Option<u64>,

    #[clap(long, env = "PIPELINE_DROP_EVERY_MS", help = "Milliseconds a simulated connection lives before it drops.")]
    pub drop_every_ms: Option<u64>,

    #[clap(long, env = "PIPELINE_DIAL_FAILURES", help = "Dials refused after every simulated drop.")]
    pub dial_failures: Option<usize>,

    #[clap(long, env = "PIPELINE_RECONNECT_BASE_MS", help = "First reconnect delay in milliseconds.")]
    pub reconnect_base_ms: Option<u64>,

    #[clap(long, env = "PIPELINE_RECONNECT_STEP_MS", help = "Reconnect delay increase per failed attempt in milliseconds.")]
    pub reconnect_step_ms: Option<u64>,

    #[clap(long, env = "PIPELINE_RECONNECT_CEILING_MS", help = "Largest reconnect delay in milliseconds before wrapping.")]
    pub reconnect_ceiling_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            address: other.address.or(self.address),
            fetch_interval_ms: other.fetch_interval_ms.or(self.fetch_interval_ms),
            batch_size: other.batch_size.or(self.batch_size),
            workers: other.workers.or(self.workers),
            run_seconds: other.run_seconds.or(self.run_seconds),
            drop_every_ms: other.drop_every_ms.or(self.drop_every_ms),
            dial_failures: other.dial_failures.or(self.dial_failures),
            reconnect_base_ms: other.reconnect_base_ms.or(self.reconnect_base_ms),
            reconnect_step_ms: other.reconnect_step_ms.or(self.reconnect_step_ms),
            reconnect_ceiling_ms: other.reconnect_ceiling_ms.or(self.reconnect_ceiling_ms),
        }
    }

    fn defaults() -> Config {
        let backoff = BackoffPolicy::default();
        Config {
            log_level: Some("info".to_string()),
            address: Some("sim://broker.local:5672".to_string()),
            fetch_interval_ms: Some(1000),
            batch_size: Some(3),
            workers: Some(2),
            run_seconds: Some(30),
            drop_every_ms: Some(7000),
            dial_failures: Some(2),
            reconnect_base_ms: Some(backoff.base.as_millis() as u64),
            reconnect_step_ms: Some(backoff.step.as_millis() as u64),
            reconnect_ceiling_ms: Some(backoff.ceiling.as_millis() as u64),
            ..Default::default()
        }
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or("sim://broker.local:5672")
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms.unwrap_or(1000))
    }

    pub fn run_for(&self) -> Option<Duration> {
        match self.run_seconds.unwrap_or(0) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn drop_every(&self) -> Duration {
        Duration::from_millis(self.drop_every_ms.unwrap_or(7000))
    }

    pub fn backoff(&self) -> BackoffPolicy {
        let default = BackoffPolicy::default();
        BackoffPolicy {
            base: self.reconnect_base_ms.map_or(default.base, Duration::from_millis),
            step: self.reconnect_step_ms.map_or(default.step, Duration::from_millis),
            ceiling: self.reconnect_ceiling_ms.map_or(default.ceiling, Duration::from_millis),
        }
    }
}

pub fn load_config() -> Config {
    load_config_from(Config::parse())
}

/// Defaults, then the JSON file, then CLI arguments and environment variables.
pub fn load_config_from(cli_args: Config) -> Config {
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("pipeline_demo.conf"));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    current_config.merge(cli_args)
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }

    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };

    match serde_json::from_str::<Config>(&config_str) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"workers": 5, "batchSize": 10, "logLevel": "debug"}}"#).unwrap();

        let cli_args = Config {
            config_path: Some(file.path().to_path_buf()),
            workers: Some(8),
            ..Default::default()
        };
        let config = load_config_from(cli_args);

        assert_eq!(config.workers, Some(8));
        assert_eq!(config.batch_size, Some(10));
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.fetch_interval(), Duration::from_secs(1));
        assert_eq!(config.backoff(), BackoffPolicy::default());
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let config = load_config_from(Config {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        });

        assert_eq!(config.workers, Some(2));
        assert_eq!(config.run_for(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_run_seconds_waits_for_signal() {
        let config = Config {
            run_seconds: Some(0),
            reconnect_ceiling_ms: Some(500),
            ..Default::default()
        };
        assert_eq!(config.run_for(), None);
        assert_eq!(config.backoff().ceiling, Duration::from_millis(500));
    }
}
