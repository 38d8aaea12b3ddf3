use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::master::MasterOptions;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub heartbeat_interval: Duration,
    pub offer_refuse_seconds: f64,
    pub max_completed_tasks: usize,
    /// JSON ACL file; without one every action is approved.
    pub acls: Option<PathBuf>,
    /// Decision when no ACL rule matches.
    pub authz_permissive: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("CORRAL_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:5050".to_string())
            .parse()
            .context("CORRAL_LISTEN_ADDR")?;

        let log_level = var("CORRAL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let heartbeat_secs: u64 = var("CORRAL_HEARTBEAT_INTERVAL_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("CORRAL_HEARTBEAT_INTERVAL_SECS")?
            .unwrap_or(15);
        anyhow::ensure!(heartbeat_secs > 0, "CORRAL_HEARTBEAT_INTERVAL_SECS must be positive");

        let offer_refuse_seconds: f64 = var("CORRAL_OFFER_REFUSE_SECONDS")
            .map(|v| v.parse())
            .transpose()
            .context("CORRAL_OFFER_REFUSE_SECONDS")?
            .unwrap_or(5.0);
        anyhow::ensure!(
            offer_refuse_seconds.is_finite() && offer_refuse_seconds >= 0.0,
            "CORRAL_OFFER_REFUSE_SECONDS must be a non-negative number"
        );

        let max_completed_tasks = var("CORRAL_MAX_COMPLETED_TASKS")
            .map(|v| v.parse())
            .transpose()
            .context("CORRAL_MAX_COMPLETED_TASKS")?
            .unwrap_or(1000);

        let acls = var("CORRAL_ACLS").filter(|v| !v.is_empty()).map(PathBuf::from);

        let authz_permissive = var("CORRAL_AUTHZ_PERMISSIVE")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(true);

        Ok(Self {
            listen_addr,
            log_level,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            offer_refuse_seconds,
            max_completed_tasks,
            acls,
            authz_permissive,
        })
    }

    pub fn master_options(&self) -> MasterOptions {
        MasterOptions {
            heartbeat_interval: self.heartbeat_interval,
            offer_refuse_seconds: self.offer_refuse_seconds,
            max_completed_tasks: self.max_completed_tasks,
            ..MasterOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:5050".parse().unwrap());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.offer_refuse_seconds, 5.0);
        assert_eq!(config.max_completed_tasks, 1000);
        assert!(config.acls.is_none());
        assert!(config.authz_permissive);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("CORRAL_LISTEN_ADDR", "0.0.0.0:6000"),
            ("CORRAL_HEARTBEAT_INTERVAL_SECS", "3"),
            ("CORRAL_OFFER_REFUSE_SECONDS", "0.5"),
            ("CORRAL_ACLS", "/etc/corral/acls.json"),
            ("CORRAL_AUTHZ_PERMISSIVE", "false"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr.port(), 6000);
        assert_eq!(config.master_options().heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.master_options().offer_refuse_seconds, 0.5);
        assert_eq!(config.acls, Some(PathBuf::from("/etc/corral/acls.json")));
        assert!(!config.authz_permissive);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(config(&[("CORRAL_LISTEN_ADDR", "nowhere")]).is_err());
        assert!(config(&[("CORRAL_HEARTBEAT_INTERVAL_SECS", "0")]).is_err());
        assert!(config(&[("CORRAL_OFFER_REFUSE_SECONDS", "-1")]).is_err());
    }
}
