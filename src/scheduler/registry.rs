//! The fixed catalogue of maintenance tasks the server knows about.
//!
//! Every deployment registers the whole catalogue. Tasks without a handler
//! wired by the host stay listed but are never dispatched.

use super::retry_policy::RetryPolicy;
use super::task::TaskSpec;
use std::time::Duration;

pub const SSL_RENEWAL: &str = "ssl_renewal";
pub const GEOIP_UPDATE: &str = "geoip_update";
pub const BLOCKLIST_UPDATE: &str = "blocklist_update";
pub const CVE_UPDATE: &str = "cve_update";
pub const SESSION_CLEANUP: &str = "session_cleanup";
pub const TOKEN_CLEANUP: &str = "token_cleanup";
pub const LOG_ROTATION: &str = "log_rotation";
pub const BACKUP_DAILY: &str = "backup_daily";
pub const HEALTHCHECK_SELF: &str = "healthcheck_self";
pub const TOR_HEALTH: &str = "tor_health";
pub const CLUSTER_HEARTBEAT: &str = "cluster_heartbeat";

const fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

fn spec(
    id: &'static str,
    name: &'static str,
    rule: &'static str,
    skippable: bool,
    timeout: Duration,
) -> TaskSpec {
    TaskSpec {
        id,
        name,
        rule,
        skippable,
        timeout: Some(timeout),
        retry: RetryPolicy::default(),
    }
}

/// Returns the built-in task catalogue.
pub fn builtin_tasks() -> Vec<TaskSpec> {
    vec![
        spec(SSL_RENEWAL, "SSL Certificate Renewal", "@daily 03:00", true, minutes(10)),
        spec(GEOIP_UPDATE, "GeoIP Database Update", "@weekly", true, minutes(30)),
        spec(BLOCKLIST_UPDATE, "Blocklist Update", "@daily 04:00", true, minutes(10)),
        spec(CVE_UPDATE, "CVE Database Update", "@daily 05:00", true, minutes(30)),
        // Non-skippable: security-relevant housekeeping
        spec(SESSION_CLEANUP, "Session Cleanup", "@hourly", false, minutes(5)),
        spec(TOKEN_CLEANUP, "Token Cleanup", "@hourly", false, minutes(5)),
        spec(LOG_ROTATION, "Log Rotation", "@daily", true, minutes(10)),
        spec(BACKUP_DAILY, "Daily Backup", "@daily 02:00", true, minutes(120)),
        spec(HEALTHCHECK_SELF, "Self Health Check", "@every 5m", true, minutes(1)),
        spec(TOR_HEALTH, "Tor Connectivity Check", "@every 10m", true, minutes(2)),
        spec(
            CLUSTER_HEARTBEAT,
            "Cluster Heartbeat",
            "@every 1m",
            false,
            Duration::from_secs(30),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::recurrence::Recurrence;
    use std::collections::HashSet;

    #[test]
    fn test_catalogue_ids_are_unique() {
        let tasks = builtin_tasks();
        let ids: HashSet<&str> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids.len(), tasks.len());
        assert_eq!(tasks.len(), 11);
    }

    #[test]
    fn test_catalogue_rules_parse() {
        for task in builtin_tasks() {
            assert!(
                Recurrence::parse(task.rule).is_ok(),
                "rule of {} should parse: {}",
                task.id,
                task.rule
            );
        }
    }

    #[test]
    fn test_non_skippable_tasks() {
        let fixed: Vec<&str> = builtin_tasks()
            .iter()
            .filter(|t| !t.skippable)
            .map(|t| t.id)
            .collect();
        assert_eq!(fixed, vec![SESSION_CLEANUP, TOKEN_CLEANUP, CLUSTER_HEARTBEAT]);
    }

    #[test]
    fn test_catalogue_uses_default_retry_policy() {
        for task in builtin_tasks() {
            assert_eq!(task.retry.max_attempts, 3);
            assert_eq!(task.retry.base, Duration::from_secs(30));
            assert_eq!(task.retry.cap, Duration::from_secs(600));
        }
        let backup = builtin_tasks()
            .into_iter()
            .find(|t| t.id == BACKUP_DAILY)
            .unwrap();
        assert_eq!(backup.timeout, Some(Duration::from_secs(7200)));
    }
}
