use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub node_id: Option<String>,

    pub scheduler: Option<SchedulerConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// IANA timezone identifier, e.g. "Europe/Berlin".
    pub timezone: Option<String>,
    /// Duration strings such as "30m" or "1h30m".
    pub catch_up_window: Option<String>,
    pub tick_secs: Option<u64>,
    pub handler_timeout: Option<String>,
    pub shutdown_grace: Option<String>,
    pub lease_ttl: Option<String>,
    pub cluster: Option<bool>,
    pub retry_jitter_ratio: Option<f64>,
    /// `[scheduler.tasks]` table: task id -> enabled.
    pub tasks: HashMap<String, bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_full_file() {
        let toml = r#"
            db_dir = "/var/lib/metasearch"
            node_id = "node-a"

            [scheduler]
            timezone = "Europe/Berlin"
            catch_up_window = "30m"
            tick_secs = 5
            cluster = true
            retry_jitter_ratio = 0.2

            [scheduler.tasks]
            geoip_update = false
            backup_daily = true
        "#;
        let config: FileConfig = toml::from_str(toml).unwrap();

        assert_eq!(config.db_dir.as_deref(), Some("/var/lib/metasearch"));
        assert_eq!(config.node_id.as_deref(), Some("node-a"));
        let scheduler = config.scheduler.unwrap();
        assert_eq!(scheduler.timezone.as_deref(), Some("Europe/Berlin"));
        assert_eq!(scheduler.catch_up_window.as_deref(), Some("30m"));
        assert_eq!(scheduler.tick_secs, Some(5));
        assert_eq!(scheduler.cluster, Some(true));
        assert_eq!(scheduler.tasks.get("geoip_update"), Some(&false));
        assert_eq!(scheduler.tasks.get("backup_daily"), Some(&true));
        assert!(scheduler.lease_ttl.is_none());
    }

    #[test]
    fn test_empty_file_is_default() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.db_dir.is_none());
        assert!(config.scheduler.is_none());
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\ntick_secs = \"often\"").unwrap();
        let err = FileConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = FileConfig::load(Path::new("/nonexistent/scheduler.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
