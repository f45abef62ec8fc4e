use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub collectors: CollectorsConfig,
    #[serde(default)]
    pub rules: RulesConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Host,
    Simulated,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_snapshot_capacity")]
    pub snapshot_capacity: usize,
    #[serde(default = "default_log_window_hours")]
    pub log_window_hours: u64,
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorsConfig {
    /// Services to report; empty means every unit systemd lists.
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default = "default_journal_max_lines")]
    pub journal_max_lines: u32,
    #[serde(default = "default_min_uid")]
    pub min_uid: u32,
    #[serde(default = "default_inactive_after_days")]
    pub inactive_after_days: u64,
    #[serde(default = "default_sshd_config_path")]
    pub sshd_config_path: String,
    #[serde(default = "default_login_defs_path")]
    pub login_defs_path: String,
    /// PEM certificates whose expiry the audit checks.
    #[serde(default)]
    pub certificate_paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RulesConfig {
    #[serde(default = "default_excellent_ratio")]
    pub excellent_ratio: f64,
    #[serde(default = "default_good_ratio")]
    pub good_ratio: f64,
    #[serde(default = "default_pass_max_days")]
    pub pass_max_days: u64,
    #[serde(default = "default_firewall_services")]
    pub firewall_services: Vec<String>,
    #[serde(default = "default_update_services")]
    pub update_services: Vec<String>,
    #[serde(default = "default_backup_services")]
    pub backup_services: Vec<String>,
    #[serde(default = "default_unnecessary_services")]
    pub unnecessary_services: Vec<String>,
    #[serde(default = "default_disk_warn_percent")]
    pub disk_warn_percent: f64,
    #[serde(default = "default_disk_fail_percent")]
    pub disk_fail_percent: f64,
    #[serde(default = "default_cert_min_days")]
    pub cert_min_days: u64,
    /// Mount points that must sit on an encrypted block device when present.
    #[serde(default = "default_encrypted_mounts")]
    pub encrypted_mounts: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interval_secs: default_interval_secs(),
            poll_timeout_ms: default_poll_timeout_ms(),
            backend: Backend::default(),
            store: StoreConfig::default(),
            collectors: CollectorsConfig::default(),
            rules: RulesConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_capacity: default_snapshot_capacity(),
            log_window_hours: default_log_window_hours(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            journal_max_lines: default_journal_max_lines(),
            min_uid: default_min_uid(),
            inactive_after_days: default_inactive_after_days(),
            sshd_config_path: default_sshd_config_path(),
            login_defs_path: default_login_defs_path(),
            certificate_paths: Vec::new(),
        }
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            excellent_ratio: default_excellent_ratio(),
            good_ratio: default_good_ratio(),
            pass_max_days: default_pass_max_days(),
            firewall_services: default_firewall_services(),
            update_services: default_update_services(),
            backup_services: default_backup_services(),
            unnecessary_services: default_unnecessary_services(),
            disk_warn_percent: default_disk_warn_percent(),
            disk_fail_percent: default_disk_fail_percent(),
            cert_min_days: default_cert_min_days(),
            encrypted_mounts: default_encrypted_mounts(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a host:port address".to_string(),
            ));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "poll_timeout_ms must be > 0".to_string(),
            ));
        }

        validate_store(&self.store)?;
        validate_collectors(&self.collectors)?;
        validate_rules(&self.rules)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_store(cfg: &StoreConfig) -> Result<(), ConfigError> {
    if cfg.snapshot_capacity < 1 {
        return Err(ConfigError::Validation(
            "store.snapshot_capacity must be >= 1".to_string(),
        ));
    }
    if cfg.log_window_hours < 1 {
        return Err(ConfigError::Validation(
            "store.log_window_hours must be >= 1".to_string(),
        ));
    }
    if cfg.max_log_entries < 1 {
        return Err(ConfigError::Validation(
            "store.max_log_entries must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_collectors(cfg: &CollectorsConfig) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for name in &cfg.services {
        if name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "collectors.services[*] must not be empty".to_string(),
            ));
        }
        if !names.insert(name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "collectors.services entry '{name}' is listed twice"
            )));
        }
    }
    if cfg.journal_max_lines < 1 {
        return Err(ConfigError::Validation(
            "collectors.journal_max_lines must be >= 1".to_string(),
        ));
    }
    if cfg.certificate_paths.iter().any(|p| p.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "collectors.certificate_paths[*] must not be empty".to_string(),
        ));
    }
    if cfg.inactive_after_days < 1 {
        return Err(ConfigError::Validation(
            "collectors.inactive_after_days must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_rules(cfg: &RulesConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&cfg.good_ratio) {
        return Err(ConfigError::Validation(
            "rules.good_ratio must be in 0..1".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&cfg.excellent_ratio) {
        return Err(ConfigError::Validation(
            "rules.excellent_ratio must be in 0..1".to_string(),
        ));
    }
    if cfg.good_ratio > cfg.excellent_ratio {
        return Err(ConfigError::Validation(
            "rules.good_ratio must not exceed rules.excellent_ratio".to_string(),
        ));
    }
    if cfg.pass_max_days < 1 {
        return Err(ConfigError::Validation(
            "rules.pass_max_days must be >= 1".to_string(),
        ));
    }
    if !(0.0..=100.0).contains(&cfg.disk_warn_percent)
        || !(0.0..=100.0).contains(&cfg.disk_fail_percent)
    {
        return Err(ConfigError::Validation(
            "rules.disk_*_percent must be in 0..100".to_string(),
        ));
    }
    if cfg.disk_warn_percent > cfg.disk_fail_percent {
        return Err(ConfigError::Validation(
            "rules.disk_warn_percent must not exceed rules.disk_fail_percent".to_string(),
        ));
    }
    if let Some(mount) = cfg.encrypted_mounts.iter().find(|m| !m.starts_with('/')) {
        return Err(ConfigError::Validation(format!(
            "rules.encrypted_mounts entry '{mount}' must be an absolute path"
        )));
    }
    Ok(())
}

fn default_listen() -> String {
    "127.0.0.1:9108".to_string()
}

const fn default_interval_secs() -> u64 {
    15
}

const fn default_poll_timeout_ms() -> u64 {
    5000
}

const fn default_snapshot_capacity() -> usize {
    100
}

const fn default_log_window_hours() -> u64 {
    24
}

const fn default_max_log_entries() -> usize {
    10_000
}

const fn default_journal_max_lines() -> u32 {
    500
}

const fn default_min_uid() -> u32 {
    1000
}

const fn default_inactive_after_days() -> u64 {
    30
}

fn default_sshd_config_path() -> String {
    "/etc/ssh/sshd_config".to_string()
}

fn default_login_defs_path() -> String {
    "/etc/login.defs".to_string()
}

const fn default_excellent_ratio() -> f64 {
    1.0
}

const fn default_good_ratio() -> f64 {
    0.7
}

const fn default_pass_max_days() -> u64 {
    90
}

fn default_firewall_services() -> Vec<String> {
    ["ufw", "firewalld", "nftables", "iptables"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_update_services() -> Vec<String> {
    ["unattended-upgrades", "dnf-automatic", "yum-cron"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_backup_services() -> Vec<String> {
    vec!["backup".to_string()]
}

fn default_unnecessary_services() -> Vec<String> {
    ["telnet", "rsh", "rlogin", "tftp", "xinetd", "vsftpd"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

const fn default_disk_warn_percent() -> f64 {
    85.0
}

const fn default_disk_fail_percent() -> f64 {
    95.0
}

const fn default_cert_min_days() -> u64 {
    14
}

fn default_encrypted_mounts() -> Vec<String> {
    vec!["/home".to_string(), "/data".to_string()]
}
