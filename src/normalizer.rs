use crate::collectors::{
    RawLogLine, RawMetric, RawPayload, RawSample, RawService, RawSession, RawUser, RawValue,
};
use crate::model::{
    AccountStatus, Domain, Entities, EnumValue, FieldValue, LifecycleState, LogEntry, LogLevel,
    ManagedStatus, Service, Session, Snapshot, Toggle, User,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot normalize {domain} field '{field}': unrecognized value '{raw_value}'")]
pub struct NormalizationError {
    pub domain: Domain,
    pub field: String,
    pub raw_value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub snapshot: Snapshot,
    pub entities: Entities,
}

/// Maps raw collector output onto the canonical model. Unrecognized values
/// drop only the field or row they occur in; each drop is recorded as a
/// warning on the resulting snapshot.
#[derive(Debug, Clone)]
pub struct Normalizer {
    inactive_after_secs: i64,
}

struct Builder {
    domain: Domain,
    fields: BTreeMap<String, FieldValue>,
    warnings: Vec<String>,
}

impl Builder {
    fn new(domain: Domain) -> Self {
        Self {
            domain,
            fields: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    fn count(&mut self, name: &str, n: usize) {
        self.set(name, FieldValue::Number(n as f64));
    }

    fn reject(&mut self, field: impl Into<String>, raw_value: impl Into<String>) {
        let err = NormalizationError {
            domain: self.domain,
            field: field.into(),
            raw_value: raw_value.into(),
        };
        debug!(error = %err, "skipping field");
        self.warnings.push(err.to_string());
    }

    fn finish(self, captured_at: i64) -> Snapshot {
        Snapshot::new(self.domain, captured_at, self.fields, self.warnings)
    }
}

impl Normalizer {
    pub fn new(inactive_after_days: u64) -> Self {
        Self {
            inactive_after_secs: (inactive_after_days as i64).saturating_mul(86_400),
        }
    }

    pub fn normalize(&self, sample: RawSample) -> Normalized {
        let mut b = Builder::new(sample.domain);
        let entities = match sample.payload {
            RawPayload::Metrics(metrics) => {
                for m in metrics {
                    normalize_metric(&mut b, m);
                }
                Entities::None
            }
            RawPayload::Services(rows) => Entities::Services(normalize_services(&mut b, rows)),
            RawPayload::Logs(rows) => Entities::Logs(normalize_logs(&mut b, rows)),
            RawPayload::Users(rows) => {
                Entities::Users(self.normalize_users(&mut b, rows, sample.captured_at))
            }
            RawPayload::Sessions(rows) => Entities::Sessions(normalize_sessions(&mut b, rows)),
        };
        Normalized {
            snapshot: b.finish(sample.captured_at),
            entities,
        }
    }

    fn normalize_users(&self, b: &mut Builder, rows: Vec<RawUser>, now: i64) -> Vec<User> {
        let users: Vec<User> = rows
            .into_iter()
            .map(|raw| {
                let recent = raw
                    .last_login
                    .map(|at| now.saturating_sub(at) <= self.inactive_after_secs)
                    .unwrap_or(false);
                let status = if recent && is_login_shell(&raw.shell) {
                    AccountStatus::Active
                } else {
                    AccountStatus::Inactive
                };
                User {
                    username: raw.name,
                    uid: raw.uid,
                    groups: raw.groups,
                    last_login: raw.last_login,
                    status,
                    shell: raw.shell,
                }
            })
            .collect();

        for u in &users {
            b.set(
                format!("user.{}.status", u.username),
                FieldValue::Enum(EnumValue::Account(u.status)),
            );
        }
        let active = users
            .iter()
            .filter(|u| u.status == AccountStatus::Active)
            .count();
        b.count("users.total", users.len());
        b.count("users.active", active);
        b.count("users.inactive", users.len() - active);
        users
    }
}

fn normalize_metric(b: &mut Builder, m: RawMetric) {
    match m.value {
        RawValue::Bytes(v) => b.set(format!("{}_gb", m.name), FieldValue::Number(v as f64 / GIB)),
        RawValue::Percent(v) => {
            if v.is_finite() && (0.0..=100.0).contains(&v) {
                b.set(format!("{}_percent", m.name), FieldValue::Number(v));
            } else {
                b.reject(m.name, v.to_string());
            }
        }
        RawValue::Count(v) => b.set(m.name, FieldValue::Number(v as f64)),
        RawValue::Seconds(v) => b.set(format!("{}_secs", m.name), FieldValue::Number(v as f64)),
        RawValue::Float(v) => {
            if v.is_finite() {
                b.set(m.name, FieldValue::Number(v));
            } else {
                b.reject(m.name, v.to_string());
            }
        }
        RawValue::Mode(v) => b.set(m.name, FieldValue::Number(v as f64)),
        RawValue::Text(v) => b.set(m.name, FieldValue::Text(v)),
        RawValue::Numeric(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => b.set(m.name, FieldValue::Number(v)),
            _ => b.reject(m.name, raw),
        },
        RawValue::Setting(raw) => match map_toggle(&raw) {
            Some(t) => b.set(m.name, FieldValue::Enum(EnumValue::Toggle(t))),
            None => b.reject(m.name, raw),
        },
    }
}

fn normalize_services(b: &mut Builder, rows: Vec<RawService>) -> Vec<Service> {
    let mut out = Vec::with_capacity(rows.len());
    for raw in rows {
        let Some(state) = map_lifecycle(&raw.active_state) else {
            b.reject(format!("{}.state", raw.name), raw.active_state);
            continue;
        };
        let Some(status) = map_managed(&raw.sub_state) else {
            b.reject(format!("{}.status", raw.name), raw.sub_state);
            continue;
        };
        let uptime_secs = match status {
            ManagedStatus::Running => raw.active_for_us.map(|us| us / 1_000_000),
            ManagedStatus::Stopped => None,
        };
        b.set(
            format!("service.{}.state", raw.name),
            FieldValue::Enum(EnumValue::Lifecycle(state)),
        );
        b.set(
            format!("service.{}.status", raw.name),
            FieldValue::Enum(EnumValue::Managed(status)),
        );
        out.push(Service {
            name: raw.name,
            state,
            status,
            uptime_secs,
        });
    }

    let by_state = |s: LifecycleState| out.iter().filter(|svc| svc.state == s).count();
    let running = out
        .iter()
        .filter(|svc| svc.status == ManagedStatus::Running)
        .count();
    b.count("services.total", out.len());
    b.count("services.active", by_state(LifecycleState::Active));
    b.count("services.inactive", by_state(LifecycleState::Inactive));
    b.count("services.failed", by_state(LifecycleState::Failed));
    b.count("services.running", running);
    out
}

fn normalize_logs(b: &mut Builder, rows: Vec<RawLogLine>) -> Vec<LogEntry> {
    let mut out = Vec::with_capacity(rows.len());
    for raw in rows {
        let raw_ts = raw.realtime_us.unwrap_or_default();
        let Ok(us) = raw_ts.trim().parse::<i64>() else {
            b.reject("timestamp", raw_ts);
            continue;
        };
        let raw_priority = raw.priority.unwrap_or_default();
        let Some(level) = map_level(&raw_priority) else {
            b.reject("priority", raw_priority);
            continue;
        };
        let Some(message) = raw.message else {
            b.reject("message", "<missing>");
            continue;
        };
        out.push(LogEntry {
            timestamp: us.div_euclid(1_000_000),
            level,
            service: raw.source.unwrap_or_else(|| "system".to_string()),
            message,
        });
    }

    let by_level = |l: LogLevel| out.iter().filter(|e| e.level == l).count();
    b.count("logs.received", out.len());
    b.count("logs.info", by_level(LogLevel::Info));
    b.count("logs.warning", by_level(LogLevel::Warning));
    b.count("logs.error", by_level(LogLevel::Error));
    if let Some(worst) = out.iter().map(|e| e.level).max() {
        b.set("logs.max_level", FieldValue::Enum(EnumValue::Level(worst)));
    }
    out
}

fn normalize_sessions(b: &mut Builder, rows: Vec<RawSession>) -> Vec<Session> {
    let mut out = Vec::with_capacity(rows.len());
    for raw in rows {
        let idle_secs = match parse_idle(&raw.idle) {
            Ok(v) => v,
            Err(()) => {
                b.reject(format!("{}@{}.idle", raw.user, raw.tty), raw.idle);
                None
            }
        };
        out.push(Session {
            username: raw.user,
            tty: raw.tty,
            origin: raw.origin,
            login_time: raw.login_time,
            idle_secs,
        });
    }

    let users: BTreeSet<&str> = out.iter().map(|s| s.username.as_str()).collect();
    let distinct = users.len();
    b.count("sessions.total", out.len());
    b.count("sessions.users", distinct);
    out
}

fn map_lifecycle(raw: &str) -> Option<LifecycleState> {
    match raw {
        "active" | "reloading" | "refreshing" => Some(LifecycleState::Active),
        "inactive" | "activating" | "deactivating" | "maintenance" => {
            Some(LifecycleState::Inactive)
        }
        "failed" => Some(LifecycleState::Failed),
        _ => None,
    }
}

fn map_managed(raw: &str) -> Option<ManagedStatus> {
    match raw {
        "running" | "reload" | "reload-signal" | "reload-notify" | "start-post" => {
            Some(ManagedStatus::Running)
        }
        "dead" | "exited" | "failed" | "auto-restart" | "auto-restart-queued" | "start-pre"
        | "start" | "stop" | "stop-watchdog" | "stop-sigterm" | "stop-sigkill" | "stop-post"
        | "final-sigterm" | "final-sigkill" | "final-watchdog" | "condition" | "cleaning" => {
            Some(ManagedStatus::Stopped)
        }
        _ => None,
    }
}

/// Accepts journald numeric priorities and plain level names.
fn map_level(raw: &str) -> Option<LogLevel> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "0" | "1" | "2" | "3" | "emerg" | "alert" | "crit" | "err" | "error" => {
            Some(LogLevel::Error)
        }
        "4" | "warn" | "warning" => Some(LogLevel::Warning),
        "5" | "6" | "7" | "notice" | "info" | "debug" => Some(LogLevel::Info),
        _ => None,
    }
}

fn map_toggle(raw: &str) -> Option<Toggle> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "on" | "true" | "enabled" => Some(Toggle::Enabled),
        "no" | "off" | "false" | "disabled" => Some(Toggle::Disabled),
        "prohibit-password" | "without-password" | "forced-commands-only" => {
            Some(Toggle::Restricted)
        }
        _ => None,
    }
}

/// `who -u` idle column: `.` is active now, `old` is over a day, `HH:MM`
/// otherwise. `?` means the terminal could not be inspected.
fn parse_idle(raw: &str) -> Result<Option<u64>, ()> {
    match raw {
        "." => Ok(Some(0)),
        "old" => Ok(Some(86_400)),
        "?" => Ok(None),
        _ => {
            let (h, m) = raw.split_once(':').ok_or(())?;
            let h: u64 = h.parse().map_err(|_| ())?;
            let m: u64 = m.parse().map_err(|_| ())?;
            if m >= 60 {
                return Err(());
            }
            h.checked_mul(3600)
                .and_then(|secs| secs.checked_add(m * 60))
                .map(Some)
                .ok_or(())
        }
    }
}

fn is_login_shell(shell: &str) -> bool {
    !(shell.ends_with("/nologin") || shell.ends_with("/false") || shell.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(domain: Domain, payload: RawPayload) -> RawSample {
        RawSample {
            domain,
            captured_at: 1_000,
            payload,
        }
    }

    #[test]
    fn bytes_are_converted_to_gigabytes() {
        let n = Normalizer::new(30).normalize(sample(
            Domain::System,
            RawPayload::Metrics(vec![
                RawMetric::new("memory.total", RawValue::Bytes(16 * 1024 * 1024 * 1024)),
                RawMetric::new("cpu.usage", RawValue::Percent(45.0)),
                RawMetric::new("uptime", RawValue::Seconds(60)),
            ]),
        ));
        assert_eq!(n.snapshot.number("memory.total_gb"), Some(16.0));
        assert_eq!(n.snapshot.number("cpu.usage_percent"), Some(45.0));
        assert_eq!(n.snapshot.number("uptime_secs"), Some(60.0));
        assert!(!n.snapshot.is_degraded());
        assert_eq!(n.entities, Entities::None);
    }

    #[test]
    fn bad_field_is_skipped_and_recorded() {
        let n = Normalizer::new(30).normalize(sample(
            Domain::System,
            RawPayload::Metrics(vec![
                RawMetric::new("security.ssh_root_login", RawValue::Setting("maybe".into())),
                RawMetric::new("security.pass_max_days", RawValue::Numeric("ninety".into())),
                RawMetric::new("cpu.usage", RawValue::Percent(f64::NAN)),
                RawMetric::new("processes", RawValue::Count(10)),
            ]),
        ));
        let snap = &n.snapshot;
        assert!(snap.field("security.ssh_root_login").is_none());
        assert!(snap.field("security.pass_max_days").is_none());
        assert!(snap.field("cpu.usage_percent").is_none());
        assert_eq!(snap.number("processes"), Some(10.0));
        assert_eq!(snap.warnings().len(), 3);
        assert!(snap.warnings()[0].contains("maybe"));
    }

    #[test]
    fn sshd_values_map_to_toggles() {
        assert_eq!(map_toggle("no"), Some(Toggle::Disabled));
        assert_eq!(map_toggle("YES"), Some(Toggle::Enabled));
        assert_eq!(map_toggle("prohibit-password"), Some(Toggle::Restricted));
        assert_eq!(map_toggle("sometimes"), None);
    }

    #[test]
    fn unknown_service_state_drops_only_that_row() {
        let row = |name: &str, active: &str, sub: &str| RawService {
            name: name.to_string(),
            active_state: active.to_string(),
            sub_state: sub.to_string(),
            active_for_us: Some(90_000_000),
        };
        let n = Normalizer::new(30).normalize(sample(
            Domain::Services,
            RawPayload::Services(vec![
                row("nginx", "active", "running"),
                row("weird", "sleeping", "running"),
                row("ufw", "inactive", "dead"),
                row("redis", "failed", "failed"),
            ]),
        ));
        let Entities::Services(services) = n.entities else {
            panic!("expected services");
        };
        assert_eq!(services.len(), 3);
        assert_eq!(services[0].uptime_secs, Some(90));
        assert_eq!(services[1].uptime_secs, None);
        assert_eq!(services[2].state, LifecycleState::Failed);
        assert_eq!(n.snapshot.number("services.total"), Some(3.0));
        assert_eq!(n.snapshot.number("services.failed"), Some(1.0));
        assert_eq!(n.snapshot.warnings().len(), 1);
        assert!(n.snapshot.warnings()[0].contains("weird.state"));
        assert_eq!(
            n.snapshot.field("service.redis.state"),
            Some(&FieldValue::Enum(EnumValue::Lifecycle(LifecycleState::Failed)))
        );
        assert_eq!(
            n.snapshot.field("service.nginx.status"),
            Some(&FieldValue::Enum(EnumValue::Managed(ManagedStatus::Running)))
        );
        assert!(n.snapshot.field("service.weird.state").is_none());
    }

    #[test]
    fn journal_priorities_map_to_levels() {
        let line = |ts: &str, prio: &str| RawLogLine {
            realtime_us: Some(ts.to_string()),
            priority: Some(prio.to_string()),
            source: None,
            message: Some("m".to_string()),
        };
        let n = Normalizer::new(30).normalize(sample(
            Domain::Logs,
            RawPayload::Logs(vec![
                line("1500000", "3"),
                line("2500000", "4"),
                line("3500000", "6"),
                line("bogus", "6"),
                line("4500000", "9"),
            ]),
        ));
        let Entities::Logs(entries) = n.entities else {
            panic!("expected logs");
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].timestamp, 1);
        assert_eq!(entries[0].level, LogLevel::Error);
        assert_eq!(entries[1].level, LogLevel::Warning);
        assert_eq!(entries[2].level, LogLevel::Info);
        assert_eq!(entries[2].service, "system");
        assert_eq!(n.snapshot.number("logs.error"), Some(1.0));
        assert_eq!(
            n.snapshot.field("logs.max_level"),
            Some(&FieldValue::Enum(EnumValue::Level(LogLevel::Error)))
        );
        assert_eq!(n.snapshot.warnings().len(), 2);
    }

    #[test]
    fn user_status_follows_recent_login_and_shell() {
        let user = |name: &str, shell: &str, last: Option<i64>| RawUser {
            name: name.to_string(),
            uid: 1000,
            groups: vec![],
            shell: shell.to_string(),
            last_login: last,
        };
        let now = 100 * 86_400;
        let n = Normalizer::new(30).normalize(RawSample {
            domain: Domain::Users,
            captured_at: now,
            payload: RawPayload::Users(vec![
                user("admin", "/bin/bash", Some(now - 3600)),
                user("old", "/bin/bash", Some(now - 31 * 86_400)),
                user("svc", "/usr/sbin/nologin", Some(now - 60)),
                user("never", "/bin/bash", None),
            ]),
        });
        let Entities::Users(users) = n.entities else {
            panic!("expected users");
        };
        let statuses: Vec<AccountStatus> = users.iter().map(|u| u.status).collect();
        assert_eq!(
            statuses,
            vec![
                AccountStatus::Active,
                AccountStatus::Inactive,
                AccountStatus::Inactive,
                AccountStatus::Inactive
            ]
        );
        assert_eq!(n.snapshot.number("users.active"), Some(1.0));
        assert_eq!(
            n.snapshot.field("user.admin.status"),
            Some(&FieldValue::Enum(EnumValue::Account(AccountStatus::Active)))
        );
    }

    #[test]
    fn unreadable_idle_keeps_session() {
        let session = |tty: &str, idle: &str| RawSession {
            user: "admin".to_string(),
            tty: tty.to_string(),
            origin: None,
            login_time: 5,
            idle: idle.to_string(),
        };
        let n = Normalizer::new(30).normalize(sample(
            Domain::Sessions,
            RawPayload::Sessions(vec![
                session("pts/0", "."),
                session("pts/1", "01:17"),
                session("pts/2", "soon"),
                session("pts/3", "9999999999999999:00"),
            ]),
        ));
        let Entities::Sessions(sessions) = n.entities else {
            panic!("expected sessions");
        };
        assert_eq!(sessions.len(), 4);
        assert_eq!(sessions[0].idle_secs, Some(0));
        assert_eq!(sessions[1].idle_secs, Some(4620));
        assert_eq!(sessions[2].idle_secs, None);
        assert_eq!(sessions[3].idle_secs, None);
        assert_eq!(n.snapshot.number("sessions.users"), Some(1.0));
        assert_eq!(n.snapshot.warnings().len(), 2);
        assert!(n.snapshot.warnings()[1].contains("pts/3"));
    }
}
