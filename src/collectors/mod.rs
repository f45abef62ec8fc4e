pub mod host;
pub mod logs;
pub mod services;
pub mod simulated;
pub mod users;

use crate::config::{Backend, Config};
use crate::model::Domain;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

/// Raw output of one collector call, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub domain: Domain,
    pub captured_at: i64,
    pub payload: RawPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Metrics(Vec<RawMetric>),
    Services(Vec<RawService>),
    Logs(Vec<RawLogLine>),
    Users(Vec<RawUser>),
    Sessions(Vec<RawSession>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawMetric {
    pub name: String,
    pub value: RawValue,
}

impl RawMetric {
    pub fn new(name: impl Into<String>, value: RawValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Bytes(u64),
    Percent(f64),
    Count(u64),
    Seconds(u64),
    Float(f64),
    /// Unix permission bits.
    Mode(u32),
    Text(String),
    /// Number still in its textual form, as read from a config file.
    Numeric(String),
    /// On/off style setting, e.g. sshd `PermitRootLogin`.
    Setting(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawService {
    pub name: String,
    pub active_state: String,
    pub sub_state: String,
    pub active_for_us: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawLogLine {
    pub realtime_us: Option<String>,
    pub priority: Option<String>,
    pub source: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawUser {
    pub name: String,
    pub uid: u32,
    pub groups: Vec<String>,
    pub shell: String,
    pub last_login: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawSession {
    pub user: String,
    pub tty: String,
    pub origin: Option<String>,
    pub login_time: i64,
    pub idle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("collection failed for {domain}: {cause}")]
pub struct CollectionError {
    pub domain: Domain,
    pub cause: CollectionCause,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectionCause {
    #[error("timeout")]
    Timeout,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("malformed data: {0}")]
    Malformed(String),
}

impl CollectionCause {
    pub fn label(&self) -> &'static str {
        match self {
            CollectionCause::Timeout => "timeout",
            CollectionCause::Unavailable(_) => "unavailable",
            CollectionCause::Malformed(_) => "malformed",
        }
    }
}

impl CollectionError {
    pub fn new(domain: Domain, cause: CollectionCause) -> Self {
        Self { domain, cause }
    }

    pub fn timeout(domain: Domain) -> Self {
        Self::new(domain, CollectionCause::Timeout)
    }

    pub fn unavailable(domain: Domain, detail: impl Into<String>) -> Self {
        Self::new(domain, CollectionCause::Unavailable(detail.into()))
    }

    pub fn malformed(domain: Domain, detail: impl Into<String>) -> Self {
        Self::new(domain, CollectionCause::Malformed(detail.into()))
    }
}

/// Fetches one domain's current raw sample from a backend. A call either
/// yields a whole sample or an error.
#[async_trait]
pub trait Collector: Send + Sync {
    fn domain(&self) -> Domain;

    async fn collect(&self) -> Result<RawSample, CollectionError>;
}

pub fn build_collectors(cfg: &Config) -> Vec<Arc<dyn Collector>> {
    match cfg.backend {
        Backend::Host => {
            let handle = host::SysinfoHandle::new();
            vec![
                Arc::new(host::SystemCollector::new(
                    handle.clone(),
                    &cfg.collectors.sshd_config_path,
                    &cfg.collectors.login_defs_path,
                    cfg.collectors.certificate_paths.clone(),
                )),
                Arc::new(host::ResourceCollector::new(handle)),
                Arc::new(services::SystemdCollector::new(
                    cfg.collectors.services.clone(),
                )),
                Arc::new(logs::JournalCollector::new(cfg.collectors.journal_max_lines)),
                Arc::new(users::AccountCollector::new(cfg.collectors.min_uid)),
                Arc::new(users::SessionCollector::new()),
            ]
        }
        Backend::Simulated => Domain::ALL
            .iter()
            .map(|d| Arc::new(simulated::SimulatedCollector::new(*d)) as Arc<dyn Collector>)
            .collect(),
    }
}

/// Runs a backend command and returns its stdout. Spawn failures and non-zero
/// exits are reported as an unavailable backend.
pub(crate) async fn run_command(
    domain: Domain,
    program: &str,
    args: &[&str],
) -> Result<String, CollectionError> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| CollectionError::unavailable(domain, format!("{program}: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CollectionError::unavailable(
            domain,
            format!("{program} exited with {}: {}", output.status, stderr.trim()),
        ));
    }

    String::from_utf8(output.stdout)
        .map_err(|err| CollectionError::malformed(domain, format!("{program} output: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_error_reads_well() {
        let err = CollectionError::timeout(Domain::Logs);
        assert_eq!(err.to_string(), "collection failed for logs: timeout");
        assert_eq!(err.cause.label(), "timeout");
    }

    #[test]
    fn simulated_backend_covers_every_domain() {
        let cfg = Config {
            backend: Backend::Simulated,
            ..Config::default()
        };
        let collectors = build_collectors(&cfg);
        let mut domains: Vec<Domain> = collectors.iter().map(|c| c.domain()).collect();
        domains.sort();
        assert_eq!(domains, Domain::ALL.to_vec());
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let err = run_command(Domain::Services, "serverguard-no-such-binary", &[])
            .await
            .unwrap_err();
        assert!(matches!(err.cause, CollectionCause::Unavailable(_)));
        assert_eq!(err.domain, Domain::Services);
    }
}
