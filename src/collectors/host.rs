use crate::collectors::{
    run_command, CollectionError, Collector, RawMetric, RawPayload, RawSample, RawValue,
};
use crate::model::{now_unix, Domain};
use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{ComponentExt, CpuExt, DiskExt, NetworkExt, NetworksExt, System, SystemExt};
use tracing::debug;

const CPU_SETTLE_INTERVAL: Duration = Duration::from_millis(250);
const SSHD_INCLUDE_DEPTH: usize = 8;
const DAY_SECS: f64 = 86_400.0;

/// sysinfo state shared by the system and resource collectors. CPU usage is a
/// delta between two refreshes, so the handle remembers when it last sampled.
#[derive(Clone)]
pub struct SysinfoHandle {
    inner: Arc<Mutex<SysinfoState>>,
}

struct SysinfoState {
    system: System,
    last_cpu_refresh: Instant,
}

impl SysinfoHandle {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_cpu();
        Self {
            inner: Arc::new(Mutex::new(SysinfoState {
                system,
                last_cpu_refresh: Instant::now(),
            })),
        }
    }

    async fn with_refreshed<T, F>(&self, domain: Domain, f: F) -> Result<T, CollectionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut System) -> T + Send + 'static,
    {
        let inner = self.inner.clone();
        let task = tokio::task::spawn_blocking(move || -> Result<T, CollectionError> {
            let mut state = inner
                .lock()
                .map_err(|_| CollectionError::unavailable(domain, "sysinfo handle poisoned"))?;
            let since = state.last_cpu_refresh.elapsed();
            if since < CPU_SETTLE_INTERVAL {
                std::thread::sleep(CPU_SETTLE_INTERVAL - since);
            }
            state.system.refresh_cpu();
            state.last_cpu_refresh = Instant::now();
            Ok(f(&mut state.system))
        });
        match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(CollectionError::unavailable(domain, err.to_string())),
        }
    }
}

pub struct SystemCollector {
    handle: SysinfoHandle,
    sshd_config: PathBuf,
    login_defs: PathBuf,
    certificates: Vec<String>,
}

impl SystemCollector {
    pub fn new(
        handle: SysinfoHandle,
        sshd_config: &str,
        login_defs: &str,
        certificates: Vec<String>,
    ) -> Self {
        Self {
            handle,
            sshd_config: PathBuf::from(sshd_config),
            login_defs: PathBuf::from(login_defs),
            certificates,
        }
    }
}

#[async_trait]
impl Collector for SystemCollector {
    fn domain(&self) -> Domain {
        Domain::System
    }

    async fn collect(&self) -> Result<RawSample, CollectionError> {
        let mut metrics = self
            .handle
            .with_refreshed(Domain::System, |system| {
                system.refresh_memory();
                system.refresh_processes();
                system_metrics(system)
            })
            .await?;

        let sshd_config = self.sshd_config.clone();
        let login_defs = self.login_defs.clone();
        let facts =
            tokio::task::spawn_blocking(move || security_facts(&sshd_config, &login_defs)).await;
        match facts {
            Ok(facts) => metrics.extend(facts),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => return Err(CollectionError::unavailable(Domain::System, err.to_string())),
        }

        let now = now_unix();
        metrics.extend(certificate_facts(&self.certificates, now).await);
        metrics.extend(encryption_facts().await);

        Ok(RawSample {
            domain: Domain::System,
            captured_at: now,
            payload: RawPayload::Metrics(metrics),
        })
    }
}

pub struct ResourceCollector {
    handle: SysinfoHandle,
}

impl ResourceCollector {
    pub fn new(handle: SysinfoHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Collector for ResourceCollector {
    fn domain(&self) -> Domain {
        Domain::Resources
    }

    async fn collect(&self) -> Result<RawSample, CollectionError> {
        let metrics = self
            .handle
            .with_refreshed(Domain::Resources, |system| {
                system.refresh_memory();
                system.refresh_disks_list();
                system.refresh_disks();
                system.refresh_networks_list();
                system.refresh_networks();
                system.refresh_components_list();
                system.refresh_components();
                resource_metrics(system)
            })
            .await?;

        Ok(RawSample {
            domain: Domain::Resources,
            captured_at: now_unix(),
            payload: RawPayload::Metrics(metrics),
        })
    }
}

fn system_metrics(system: &System) -> Vec<RawMetric> {
    let mut out = Vec::new();

    if let Some(v) = system.host_name() {
        out.push(RawMetric::new("host.name", RawValue::Text(v)));
    }
    if let Some(v) = system.name() {
        out.push(RawMetric::new("os.name", RawValue::Text(v)));
    }
    if let Some(v) = system.os_version() {
        out.push(RawMetric::new("os.version", RawValue::Text(v)));
    }
    if let Some(v) = system.kernel_version() {
        out.push(RawMetric::new("kernel.version", RawValue::Text(v)));
    }

    out.push(RawMetric::new("uptime", RawValue::Seconds(system.uptime())));
    out.push(RawMetric::new(
        "processes",
        RawValue::Count(system.processes().len() as u64),
    ));
    out.push(RawMetric::new(
        "cpu.cores",
        RawValue::Count(system.cpus().len() as u64),
    ));
    out.push(RawMetric::new(
        "cpu.usage",
        RawValue::Percent(average_cpu_usage(system)),
    ));

    let load = system.load_average();
    out.push(RawMetric::new("load.one", RawValue::Float(load.one)));
    out.push(RawMetric::new("load.five", RawValue::Float(load.five)));
    out.push(RawMetric::new("load.fifteen", RawValue::Float(load.fifteen)));

    let total = system.total_memory();
    let used = system.used_memory();
    out.push(RawMetric::new("memory.used", RawValue::Bytes(used)));
    out.push(RawMetric::new("memory.total", RawValue::Bytes(total)));
    out.push(RawMetric::new(
        "memory.usage",
        RawValue::Percent(percent(used, total)),
    ));

    out
}

fn resource_metrics(system: &System) -> Vec<RawMetric> {
    let mut out = Vec::new();

    for (idx, cpu) in system.cpus().iter().enumerate() {
        out.push(RawMetric::new(
            format!("cpu.core{}.usage", idx + 1),
            RawValue::Percent(cpu.cpu_usage() as f64),
        ));
    }

    let mem_total = system.total_memory();
    let mem_used = system.used_memory();
    out.push(RawMetric::new("memory.used", RawValue::Bytes(mem_used)));
    out.push(RawMetric::new("memory.total", RawValue::Bytes(mem_total)));
    out.push(RawMetric::new(
        "memory.usage",
        RawValue::Percent(percent(mem_used, mem_total)),
    ));
    out.push(RawMetric::new("swap.used", RawValue::Bytes(system.used_swap())));
    out.push(RawMetric::new("swap.total", RawValue::Bytes(system.total_swap())));

    for d in system.disks() {
        let mount = d.mount_point().to_string_lossy().to_string();
        let total = d.total_space();
        let used = total.saturating_sub(d.available_space());
        out.push(RawMetric::new(format!("disk.{mount}.used"), RawValue::Bytes(used)));
        out.push(RawMetric::new(format!("disk.{mount}.total"), RawValue::Bytes(total)));
        out.push(RawMetric::new(
            format!("disk.{mount}.usage"),
            RawValue::Percent(percent(used, total)),
        ));
    }

    for (iface, data) in system.networks().iter() {
        out.push(RawMetric::new(
            format!("net.{iface}.rx_total"),
            RawValue::Bytes(data.total_received()),
        ));
        out.push(RawMetric::new(
            format!("net.{iface}.tx_total"),
            RawValue::Bytes(data.total_transmitted()),
        ));
    }

    let mut temps = 0_usize;
    for c in system.components() {
        let celsius = c.temperature() as f64;
        if celsius > 0.0 {
            temps += 1;
            out.push(RawMetric::new(
                format!("temp.{}", c.label()),
                RawValue::Float(celsius),
            ));
        }
    }
    debug!(temperature_sensors = temps, "collected resource metrics");

    out
}

fn average_cpu_usage(system: &System) -> f64 {
    if system.cpus().is_empty() {
        return 0.0;
    }
    let sum: f32 = system.cpus().iter().map(|c| c.cpu_usage()).sum();
    (sum / system.cpus().len() as f32) as f64
}

fn percent(used: u64, total: u64) -> f64 {
    if total > 0 {
        (used as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

fn security_facts(sshd_config: &Path, login_defs: &Path) -> Vec<RawMetric> {
    let mut out = Vec::new();

    match fs::read_to_string(sshd_config) {
        Ok(text) => {
            let base = sshd_config.parent().unwrap_or(Path::new("/"));
            let value = permit_root_login(&text, &|pattern| read_sshd_includes(base, pattern));
            out.push(RawMetric::new("security.ssh_root_login", RawValue::Setting(value)));
        }
        Err(err) => debug!(path = %sshd_config.display(), error = %err, "sshd config not readable"),
    }

    match fs::read_to_string(login_defs) {
        Ok(text) => {
            if let Some(v) = login_defs_value(&text, "PASS_MAX_DAYS") {
                out.push(RawMetric::new(
                    "security.pass_max_days",
                    RawValue::Numeric(v.to_string()),
                ));
            }
        }
        Err(err) => debug!(path = %login_defs.display(), error = %err, "login.defs not readable"),
    }

    if let Some(mode) = file_mode(Path::new("/etc/shadow")) {
        out.push(RawMetric::new("security.shadow_mode", RawValue::Mode(mode)));
    }
    if let Some(mode) = file_mode(Path::new("/etc/passwd")) {
        out.push(RawMetric::new("security.passwd_mode", RawValue::Mode(mode)));
    }

    out
}

/// First global `PermitRootLogin` directive, following `Include` lines where
/// they appear. sshd ignores later duplicates; a `Match` block ends the global
/// section of the file it appears in.
fn permit_root_login(sshd_config: &str, read_include: &dyn Fn(&str) -> Vec<String>) -> String {
    find_permit_root_login(sshd_config, read_include, SSHD_INCLUDE_DEPTH)
        .unwrap_or_else(|| "prohibit-password".to_string())
}

fn find_permit_root_login(
    text: &str,
    read_include: &dyn Fn(&str) -> Vec<String>,
    depth: usize,
) -> Option<String> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(key) = parts.next() else {
            continue;
        };
        if key.eq_ignore_ascii_case("match") {
            return None;
        }
        if key.eq_ignore_ascii_case("include") {
            if depth == 0 {
                continue;
            }
            for pattern in parts {
                for included in read_include(pattern) {
                    if let Some(v) = find_permit_root_login(&included, read_include, depth - 1) {
                        return Some(v);
                    }
                }
            }
            continue;
        }
        if key.eq_ignore_ascii_case("permitrootlogin") {
            if let Some(value) = parts.next() {
                return Some(value.to_ascii_lowercase());
            }
        }
    }
    None
}

/// Relative include paths resolve against the sshd config directory.
fn read_sshd_includes(base: &Path, pattern: &str) -> Vec<String> {
    let pattern = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        base.join(pattern)
    };
    expand_file_glob(&pattern)
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok())
        .collect()
}

/// Expands one `*` in the final path component, in lexical order.
fn expand_file_glob(pattern: &Path) -> Vec<PathBuf> {
    let Some(name) = pattern.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    let Some((prefix, suffix)) = name.split_once('*') else {
        return vec![pattern.to_path_buf()];
    };
    let dir = pattern.parent().unwrap_or(Path::new("/"));
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| {
                    n.len() >= prefix.len() + suffix.len()
                        && n.starts_with(prefix)
                        && n.ends_with(suffix)
                })
        })
        .collect();
    out.sort();
    out
}

/// Days until each certificate expires, or why it could not be read.
async fn certificate_facts(paths: &[String], now: i64) -> Vec<RawMetric> {
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let args = ["x509", "-enddate", "-noout", "-in", path.as_str()];
        let expiry = run_command(Domain::System, "openssl", &args)
            .await
            .map_err(|err| err.cause.to_string())
            .and_then(|text| {
                parse_not_after(&text)
                    .ok_or_else(|| format!("unexpected openssl output '{}'", text.trim()))
            });
        match expiry {
            Ok(not_after) => {
                let days_left = ((not_after - now) as f64 / DAY_SECS).floor();
                out.push(RawMetric::new(
                    format!("cert.{path}.days_left"),
                    RawValue::Float(days_left),
                ));
            }
            Err(reason) => {
                debug!(path = %path, reason = %reason, "certificate not readable");
                out.push(RawMetric::new(
                    format!("cert.{path}.error"),
                    RawValue::Text(reason),
                ));
            }
        }
    }
    out
}

/// `notAfter=Jan  5 12:00:00 2025 GMT` as printed by `openssl x509 -enddate`.
fn parse_not_after(output: &str) -> Option<i64> {
    let raw = output.trim().strip_prefix("notAfter=")?;
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let naive = NaiveDateTime::parse_from_str(&collapsed, "%b %d %H:%M:%S %Y GMT").ok()?;
    Some(Utc.from_utc_datetime(&naive).timestamp())
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    #[serde(rename = "type")]
    kind: String,
    mountpoint: Option<String>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

/// Whether each mounted filesystem sits on (or below) a dm-crypt device.
async fn encryption_facts() -> Vec<RawMetric> {
    let listed = run_command(Domain::System, "lsblk", &["-J", "-o", "NAME,TYPE,MOUNTPOINT"]).await;
    let text = match listed {
        Ok(text) => text,
        Err(err) => {
            debug!(error = %err, "block devices not listed");
            return Vec::new();
        }
    };
    match mount_encryption(&text) {
        Ok(mounts) => mounts
            .into_iter()
            .map(|(mount, encrypted)| {
                let setting = if encrypted { "yes" } else { "no" };
                RawMetric::new(
                    format!("mount.{mount}.encrypted"),
                    RawValue::Setting(setting.to_string()),
                )
            })
            .collect(),
        Err(err) => {
            debug!(error = %err, "lsblk output not understood");
            Vec::new()
        }
    }
}

fn mount_encryption(lsblk_json: &str) -> Result<Vec<(String, bool)>, serde_json::Error> {
    fn walk(dev: &BlockDevice, under_crypt: bool, out: &mut Vec<(String, bool)>) {
        let encrypted = under_crypt || dev.kind == "crypt";
        if let Some(mount) = dev.mountpoint.as_deref().filter(|m| m.starts_with('/')) {
            out.push((mount.to_string(), encrypted));
        }
        for child in &dev.children {
            walk(child, encrypted, out);
        }
    }

    let parsed: LsblkOutput = serde_json::from_str(lsblk_json)?;
    let mut out = Vec::new();
    for dev in &parsed.blockdevices {
        walk(dev, false, &mut out);
    }
    Ok(out)
}

fn login_defs_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.starts_with('#'))
        .filter_map(|l| {
            let mut parts = l.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(k), Some(v)) if k == key => Some(v),
                _ => None,
            }
        })
        .last()
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .ok()
        .map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}
