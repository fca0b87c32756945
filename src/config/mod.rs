mod file_config;

pub use file_config::{FileConfig, SchedulerConfig};

use crate::scheduler::parse_duration;
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub node_id: Option<String>,
    pub cluster: bool,
    pub timezone: Option<String>,
    pub catch_up_window: Option<String>,
    pub tick_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    /// Identifies this process in lease rows and run history.
    pub node_id: String,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// IANA timezone identifier. Validated when applied to the scheduler.
    pub timezone: String,
    pub catch_up_window: Duration,
    pub tick_interval: Duration,
    /// Timeout for tasks whose catalogue entry does not set one.
    pub handler_timeout: Duration,
    pub shutdown_grace: Duration,
    pub lease_ttl: Duration,
    /// Several server processes share the database.
    pub cluster: bool,
    pub retry_jitter_ratio: f64,
    /// Per-task enabled flags. Ignored for tasks that are not skippable.
    pub task_enabled: HashMap<String, bool>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            catch_up_window: Duration::from_secs(3600),
            tick_interval: Duration::from_secs(15),
            handler_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(120),
            cluster: false,
            retry_jitter_ratio: 0.0,
            task_enabled: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        // Validate db_dir exists
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let node_id = file
            .node_id
            .or_else(|| cli.node_id.clone())
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let sched_file = file.scheduler.unwrap_or_default();
        let defaults = SchedulerSettings::default();

        let timezone = sched_file
            .timezone
            .or_else(|| cli.timezone.clone())
            .unwrap_or(defaults.timezone);

        let catch_up_window = resolve_duration(
            "catch_up_window",
            sched_file
                .catch_up_window
                .as_deref()
                .or(cli.catch_up_window.as_deref()),
            defaults.catch_up_window,
            true,
        );

        let tick_secs = sched_file.tick_secs.or(cli.tick_secs).unwrap_or(0);
        let tick_interval = if tick_secs == 0 {
            defaults.tick_interval
        } else {
            Duration::from_secs(tick_secs)
        };

        let handler_timeout = resolve_duration(
            "handler_timeout",
            sched_file.handler_timeout.as_deref(),
            defaults.handler_timeout,
            false,
        );
        let shutdown_grace = resolve_duration(
            "shutdown_grace",
            sched_file.shutdown_grace.as_deref(),
            defaults.shutdown_grace,
            false,
        );
        let lease_ttl = resolve_duration(
            "lease_ttl",
            sched_file.lease_ttl.as_deref(),
            defaults.lease_ttl,
            false,
        );

        let retry_jitter_ratio = match sched_file.retry_jitter_ratio {
            Some(ratio) if (0.0..=1.0).contains(&ratio) => ratio,
            Some(ratio) => {
                warn!(
                    "retry_jitter_ratio {} is outside [0, 1], using {}",
                    ratio, defaults.retry_jitter_ratio
                );
                defaults.retry_jitter_ratio
            }
            None => defaults.retry_jitter_ratio,
        };

        let scheduler = SchedulerSettings {
            timezone,
            catch_up_window,
            tick_interval,
            handler_timeout,
            shutdown_grace,
            lease_ttl,
            cluster: sched_file.cluster.unwrap_or(cli.cluster),
            retry_jitter_ratio,
            task_enabled: sched_file.tasks,
        };

        Ok(Self {
            db_dir,
            node_id,
            scheduler,
        })
    }

    pub fn scheduler_db_path(&self) -> PathBuf {
        self.db_dir.join("scheduler.db")
    }
}

/// Parses an optional duration setting. Invalid or zero values are logged
/// and replaced by the default; configuration never aborts on them.
fn resolve_duration(
    name: &str,
    value: Option<&str>,
    default: Duration,
    allow_zero: bool,
) -> Duration {
    let Some(raw) = value else {
        return default;
    };
    match parse_duration(raw) {
        Ok(d) if allow_zero || !d.is_zero() => d,
        Ok(_) => {
            warn!("{} must be greater than zero, using {:?}", name, default);
            default
        }
        Err(e) => {
            warn!("Invalid {} '{}': {}. Using {:?}", name, raw, e, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    fn cli_with_dir(dir: &TempDir) -> CliConfig {
        CliConfig {
            db_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_defaults() {
        let temp_dir = make_temp_db_dir();
        let config = AppConfig::resolve(&cli_with_dir(&temp_dir), None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.scheduler, SchedulerSettings::default());
        // Random node id
        assert!(uuid::Uuid::parse_str(&config.node_id).is_ok());
        assert_eq!(
            config.scheduler_db_path(),
            temp_dir.path().join("scheduler.db")
        );
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            node_id: Some("node-a".to_string()),
            cluster: true,
            timezone: Some("America/New_York".to_string()),
            catch_up_window: Some("45m".to_string()),
            tick_secs: Some(5),
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.node_id, "node-a");
        assert!(config.scheduler.cluster);
        assert_eq!(config.scheduler.timezone, "America/New_York");
        assert_eq!(config.scheduler.catch_up_window, Duration::from_secs(2700));
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            node_id: Some("cli-node".to_string()),
            timezone: Some("UTC".to_string()),
            catch_up_window: Some("10m".to_string()),
            tick_secs: Some(30),
            ..Default::default()
        };

        let mut tasks = HashMap::new();
        tasks.insert("geoip_update".to_string(), false);
        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            node_id: Some("toml-node".to_string()),
            scheduler: Some(SchedulerConfig {
                timezone: Some("Europe/Berlin".to_string()),
                catch_up_window: Some("1h30m".to_string()),
                lease_ttl: Some("5m".to_string()),
                tasks,
                ..Default::default()
            }),
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.node_id, "toml-node");
        assert_eq!(config.scheduler.timezone, "Europe/Berlin");
        assert_eq!(config.scheduler.catch_up_window, Duration::from_secs(5400));
        assert_eq!(config.scheduler.lease_ttl, Duration::from_secs(300));
        assert_eq!(config.scheduler.task_enabled.get("geoip_update"), Some(&false));
        // CLI value used when TOML doesn't specify
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_durations_fall_back_to_defaults() {
        let temp_dir = make_temp_db_dir();
        let file_config = FileConfig {
            scheduler: Some(SchedulerConfig {
                catch_up_window: Some("a while".to_string()),
                lease_ttl: Some("0s".to_string()),
                shutdown_grace: Some("10 fortnights".to_string()),
                retry_jitter_ratio: Some(3.0),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli_with_dir(&temp_dir), Some(file_config)).unwrap();
        let defaults = SchedulerSettings::default();

        assert_eq!(config.scheduler.catch_up_window, defaults.catch_up_window);
        assert_eq!(config.scheduler.lease_ttl, defaults.lease_ttl);
        assert_eq!(config.scheduler.shutdown_grace, defaults.shutdown_grace);
        assert_eq!(config.scheduler.retry_jitter_ratio, 0.0);
    }

    #[test]
    fn test_overflowing_durations_fall_back_to_defaults() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            catch_up_window: Some("300000000000000000d".to_string()),
            ..cli_with_dir(&temp_dir)
        };
        let file_config = FileConfig {
            scheduler: Some(SchedulerConfig {
                handler_timeout: Some("999999999999999999h".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();
        let defaults = SchedulerSettings::default();

        assert_eq!(config.scheduler.catch_up_window, defaults.catch_up_window);
        assert_eq!(config.scheduler.handler_timeout, defaults.handler_timeout);
    }

    #[test]
    fn test_zero_catch_up_window_is_allowed() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            catch_up_window: Some("0".to_string()),
            ..cli_with_dir(&temp_dir)
        };
        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.scheduler.catch_up_window, Duration::ZERO);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_db_dir_not_directory_error() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(temp_file.path().to_path_buf()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not a directory"));
    }
}
