use crate::model::{
    now_unix, CheckResult, Domain, LogEntry, LogLevel, Service, Session, Snapshot, User,
};
use crate::query::{QueryApi, QueryError};
use crate::rules::AuditReport;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

const RECENT_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Daily,
    Weekly,
    Monthly,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Daily => "daily",
            ReportKind::Weekly => "weekly",
            ReportKind::Monthly => "monthly",
        }
    }

    pub fn default_period(&self) -> &'static str {
        match self {
            ReportKind::Daily => "last-24h",
            ReportKind::Weekly => "last-7d",
            ReportKind::Monthly => "last-30d",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(ReportKind::Daily),
            "weekly" => Ok(ReportKind::Weekly),
            "monthly" => Ok(ReportKind::Monthly),
            other => Err(format!(
                "unknown report kind '{other}' (expected daily, weekly or monthly)"
            )),
        }
    }
}

/// Accepts `last-24h`, `last-7d` or a bare humantime duration such as `36h`.
pub fn parse_period(raw: &str) -> Result<Duration, String> {
    let spec = raw.trim();
    let spec = spec.strip_prefix("last-").unwrap_or(spec);
    let period =
        humantime::parse_duration(spec).map_err(|err| format!("invalid period '{raw}': {err}"))?;
    if period.as_secs() == 0 {
        return Err(format!("period '{raw}' must be at least one second"));
    }
    Ok(period)
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportPeriod {
    pub label: String,
    pub from: i64,
    pub to: i64,
    pub from_rfc3339: String,
    pub to_rfc3339: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LogSummary {
    pub total: usize,
    pub info: usize,
    pub warning: usize,
    pub error: usize,
    pub recent_errors: Vec<LogEntry>,
}

impl LogSummary {
    fn from_entries(entries: &[LogEntry]) -> Self {
        let count = |level: LogLevel| entries.iter().filter(|e| e.level == level).count();
        let errors: Vec<&LogEntry> = entries
            .iter()
            .filter(|e| e.level == LogLevel::Error)
            .collect();
        let skip = errors.len().saturating_sub(RECENT_ERRORS);
        Self {
            total: entries.len(),
            info: count(LogLevel::Info),
            warning: count(LogLevel::Warning),
            error: errors.len(),
            recent_errors: errors.into_iter().skip(skip).cloned().collect(),
        }
    }
}

/// A report section left empty because its domain has never been collected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnavailableSection {
    pub domain: Domain,
    pub reason: String,
}

/// Everything a renderer needs for one report, already evaluated.
#[derive(Debug, Clone, Serialize)]
pub struct ReportBundle {
    pub kind: ReportKind,
    pub generated_at: String,
    pub period: ReportPeriod,
    pub status: Option<Snapshot>,
    pub resources: Option<Snapshot>,
    pub resource_history: Vec<Snapshot>,
    pub services: Vec<Service>,
    pub logs: LogSummary,
    pub users: Vec<User>,
    pub sessions: Vec<Session>,
    pub audit: AuditReport,
    pub compliance: Vec<CheckResult>,
    pub unavailable: Vec<UnavailableSection>,
}

pub fn rfc3339(unix: i64) -> String {
    let at = UNIX_EPOCH + Duration::from_secs(unix.max(0) as u64);
    humantime::format_rfc3339_seconds(at).to_string()
}

impl QueryApi {
    pub async fn generate_report_data(
        &self,
        kind: ReportKind,
        period: Option<&str>,
    ) -> Result<ReportBundle, QueryError> {
        let raw = period.unwrap_or_else(|| kind.default_period());
        let length = parse_period(raw).map_err(QueryError::Validation)?;
        let label = raw.trim().to_string();

        let to = now_unix();
        let from = to.saturating_sub(i64::try_from(length.as_secs()).unwrap_or(i64::MAX));

        let mut unavailable = Vec::new();
        let status = section(self.get_system_status().await, &mut unavailable)?;
        let resources = section(self.get_resource_usage().await, &mut unavailable)?;
        let resource_history =
            section(self.history(Domain::Resources, from, to).await, &mut unavailable)?;
        let services = section(self.list_services().await, &mut unavailable)?;
        section(self.ensure_available(Domain::Logs).await, &mut unavailable)?;
        let logs = self.store().logs_since(from, to).await;
        let users = section(self.list_users().await, &mut unavailable)?;
        let sessions = section(self.list_sessions().await, &mut unavailable)?;

        Ok(ReportBundle {
            kind,
            generated_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
            period: ReportPeriod {
                label,
                from,
                to,
                from_rfc3339: rfc3339(from),
                to_rfc3339: rfc3339(to),
            },
            status,
            resources,
            resource_history,
            services,
            logs: LogSummary::from_entries(&logs),
            users,
            sessions,
            audit: self.run_audit().await,
            compliance: self.run_compliance().await,
            unavailable,
        })
    }
}

/// Collection failures empty the section and are listed once per domain;
/// any other error aborts the report.
fn section<T: Default>(
    result: Result<T, QueryError>,
    unavailable: &mut Vec<UnavailableSection>,
) -> Result<T, QueryError> {
    match result {
        Ok(value) => Ok(value),
        Err(QueryError::Collection(err)) => {
            if !unavailable.iter().any(|u| u.domain == err.domain) {
                warn!(domain = err.domain.as_str(), cause = %err.cause, "report section unavailable");
                unavailable.push(UnavailableSection {
                    domain: err.domain,
                    reason: err.cause.to_string(),
                });
            }
            Ok(T::default())
        }
        Err(other) => Err(other),
    }
}
