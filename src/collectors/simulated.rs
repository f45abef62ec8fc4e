use crate::collectors::{
    CollectionError, Collector, RawLogLine, RawMetric, RawPayload, RawSample, RawService,
    RawSession, RawUser, RawValue,
};
use crate::model::{now_unix, Domain};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;
const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

/// Deterministic demo backend. Values are anchored to the time of the call so
/// time-windowed queries keep working.
pub struct SimulatedCollector {
    domain: Domain,
    latency: Duration,
    logs_emitted: AtomicBool,
}

impl SimulatedCollector {
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            latency: Duration::ZERO,
            logs_emitted: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl Collector for SimulatedCollector {
    fn domain(&self) -> Domain {
        self.domain
    }

    async fn collect(&self) -> Result<RawSample, CollectionError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let now = now_unix();
        let payload = match self.domain {
            Domain::System => RawPayload::Metrics(system()),
            Domain::Resources => RawPayload::Metrics(resources()),
            Domain::Services => RawPayload::Services(services()),
            Domain::Logs => {
                // The journal fixture is append-only: hand it out once.
                if self.logs_emitted.swap(true, Ordering::SeqCst) {
                    RawPayload::Logs(Vec::new())
                } else {
                    RawPayload::Logs(logs(now))
                }
            }
            Domain::Users => RawPayload::Users(users(now)),
            Domain::Sessions => RawPayload::Sessions(sessions(now)),
        };
        Ok(RawSample {
            domain: self.domain,
            captured_at: now,
            payload,
        })
    }
}

fn gib(v: f64) -> u64 {
    (v * GIB as f64) as u64
}

fn system() -> Vec<RawMetric> {
    vec![
        RawMetric::new("host.name", RawValue::Text("serverguard-demo".to_string())),
        RawMetric::new("os.name", RawValue::Text("Debian GNU/Linux".to_string())),
        RawMetric::new("os.version", RawValue::Text("12".to_string())),
        RawMetric::new("kernel.version", RawValue::Text("6.1.0-28-amd64".to_string())),
        RawMetric::new("uptime", RawValue::Seconds((15 * DAY + 7 * HOUR) as u64)),
        RawMetric::new("processes", RawValue::Count(212)),
        RawMetric::new("cpu.cores", RawValue::Count(4)),
        RawMetric::new("cpu.usage", RawValue::Percent(45.0)),
        RawMetric::new("load.one", RawValue::Float(2.15)),
        RawMetric::new("load.five", RawValue::Float(1.98)),
        RawMetric::new("load.fifteen", RawValue::Float(1.85)),
        RawMetric::new("memory.used", RawValue::Bytes(gib(8.2))),
        RawMetric::new("memory.total", RawValue::Bytes(16 * GIB)),
        RawMetric::new("memory.usage", RawValue::Percent(51.25)),
        RawMetric::new("security.ssh_root_login", RawValue::Setting("no".to_string())),
        RawMetric::new("security.pass_max_days", RawValue::Numeric("90".to_string())),
        RawMetric::new("security.shadow_mode", RawValue::Mode(0o644)),
        RawMetric::new("security.passwd_mode", RawValue::Mode(0o644)),
        RawMetric::new(
            "cert./etc/ssl/certs/serverguard-demo.pem.days_left",
            RawValue::Float(62.0),
        ),
        RawMetric::new("mount./.encrypted", RawValue::Setting("yes".to_string())),
        RawMetric::new("mount./home.encrypted", RawValue::Setting("yes".to_string())),
        RawMetric::new("mount./data.encrypted", RawValue::Setting("no".to_string())),
    ]
}

fn resources() -> Vec<RawMetric> {
    let mut out = Vec::new();
    for (idx, usage) in [30.0, 45.0, 35.0, 50.0].iter().enumerate() {
        out.push(RawMetric::new(
            format!("cpu.core{}.usage", idx + 1),
            RawValue::Percent(*usage),
        ));
    }
    out.push(RawMetric::new("memory.used", RawValue::Bytes(gib(8.2))));
    out.push(RawMetric::new("memory.total", RawValue::Bytes(16 * GIB)));
    out.push(RawMetric::new("memory.usage", RawValue::Percent(51.25)));
    out.push(RawMetric::new("swap.used", RawValue::Bytes(0)));
    out.push(RawMetric::new("swap.total", RawValue::Bytes(2 * GIB)));
    for (mount, used, total) in [("/", 124, 500), ("/data", 890, 1000)] {
        out.push(RawMetric::new(format!("disk.{mount}.used"), RawValue::Bytes(used * GIB)));
        out.push(RawMetric::new(format!("disk.{mount}.total"), RawValue::Bytes(total * GIB)));
        out.push(RawMetric::new(
            format!("disk.{mount}.usage"),
            RawValue::Percent(used as f64 / total as f64 * 100.0),
        ));
    }
    out.push(RawMetric::new("net.eth0.rx_total", RawValue::Bytes(gib(42.7))));
    out.push(RawMetric::new("net.eth0.tx_total", RawValue::Bytes(gib(13.1))));
    out
}

fn services() -> Vec<RawService> {
    let running_for = ((16 * DAY + 7 * HOUR) * 1_000_000) as u64;
    let svc = |name: &str, active: &str, sub: &str, up: Option<u64>| RawService {
        name: name.to_string(),
        active_state: active.to_string(),
        sub_state: sub.to_string(),
        active_for_us: up,
    };
    vec![
        svc("nginx", "active", "running", Some(running_for)),
        svc("postgresql", "active", "running", Some(running_for)),
        svc("redis", "active", "running", Some(running_for)),
        svc("docker", "active", "running", Some(running_for)),
        svc("ufw", "inactive", "dead", None),
        svc("unattended-upgrades", "active", "running", Some(running_for)),
        svc("backup", "inactive", "dead", None),
    ]
}

fn logs(now: i64) -> Vec<RawLogLine> {
    let line = |offset: i64, level: &str, source: &str, message: &str| RawLogLine {
        realtime_us: Some(((now - offset) * 1_000_000).to_string()),
        priority: Some(level.to_string()),
        source: Some(source.to_string()),
        message: Some(message.to_string()),
    };
    vec![
        line(8218, "error", "app", "Failed to connect to API endpoint"),
        line(3010, "error", "app", "Connection timeout to API"),
        line(13, "info", "nginx", "Request processed successfully"),
        line(10, "info", "app", "User login: admin"),
        line(6, "warning", "postgresql", "Slow query detected (2.3s)"),
        line(3, "error", "app", "Failed to connect to API endpoint"),
        line(0, "info", "nginx", "SSL certificate renewed"),
    ]
}

fn users(now: i64) -> Vec<RawUser> {
    let user = |name: &str, uid: u32, groups: &[&str], shell: &str, last: Option<i64>| RawUser {
        name: name.to_string(),
        uid,
        groups: groups.iter().map(|g| g.to_string()).collect(),
        shell: shell.to_string(),
        last_login: last.map(|ago| now - ago),
    };
    vec![
        user("root", 0, &["root"], "/bin/bash", None),
        user("admin", 1000, &["sudo", "docker"], "/bin/bash", Some(6 * HOUR)),
        user("deploy", 1001, &["docker"], "/bin/bash", Some(20 * HOUR)),
        user("monitor", 1002, &["monitoring"], "/bin/bash", Some(2 * DAY)),
        user("backup", 1003, &["backup"], "/usr/sbin/nologin", Some(16 * DAY)),
    ]
}

fn sessions(now: i64) -> Vec<RawSession> {
    vec![
        RawSession {
            user: "admin".to_string(),
            tty: "pts/0".to_string(),
            origin: Some("192.168.1.100".to_string()),
            login_time: now - (6 * HOUR + 2 * 60),
            idle: "06:02".to_string(),
        },
        RawSession {
            user: "deploy".to_string(),
            tty: "pts/1".to_string(),
            origin: Some("10.0.0.50".to_string()),
            login_time: now - (HOUR + 17 * 60),
            idle: "01:17".to_string(),
        },
    ]
}
