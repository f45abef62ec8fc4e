use crate::collectors::{run_command, CollectionError, Collector, RawPayload, RawSample, RawService};
use crate::model::{now_unix, Domain};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Service states from systemd. An optional watch list narrows the report to
/// the named services.
pub struct SystemdCollector {
    watch: Vec<String>,
}

impl SystemdCollector {
    pub fn new(watch: Vec<String>) -> Self {
        Self { watch }
    }

    async fn active_since(&self, units: &[String]) -> HashMap<String, u64> {
        if units.is_empty() {
            return HashMap::new();
        }
        let mut args = vec!["show", "--property=Id,ActiveEnterTimestampMonotonic"];
        args.extend(units.iter().map(String::as_str));
        match run_command(Domain::Services, "systemctl", &args).await {
            Ok(text) => parse_show_monotonic(&text),
            Err(err) => {
                warn!(error = %err, "systemctl show failed, service uptimes omitted");
                HashMap::new()
            }
        }
    }
}

#[async_trait]
impl Collector for SystemdCollector {
    fn domain(&self) -> Domain {
        Domain::Services
    }

    async fn collect(&self) -> Result<RawSample, CollectionError> {
        let listing = run_command(
            Domain::Services,
            "systemctl",
            &[
                "list-units",
                "--type=service",
                "--all",
                "--no-pager",
                "--plain",
                "--no-legend",
            ],
        )
        .await?;

        let mut units = parse_list_units(&listing)
            .map_err(|detail| CollectionError::malformed(Domain::Services, detail))?;
        if !self.watch.is_empty() {
            units.retain(|u| self.watch.iter().any(|w| *w == u.name));
        }

        let running: Vec<String> = units
            .iter()
            .filter(|u| u.sub_state == "running")
            .map(|u| format!("{}.service", u.name))
            .collect();
        let entered = self.active_since(&running).await;
        let now_us = host_monotonic_us().await;

        for unit in &mut units {
            let enter_us = entered.get(&unit.name).copied().filter(|v| *v > 0);
            unit.active_for_us = match (enter_us, now_us) {
                (Some(enter), Some(now)) => Some(now.saturating_sub(enter)),
                _ => None,
            };
        }
        debug!(services = units.len(), "collected systemd services");

        Ok(RawSample {
            domain: Domain::Services,
            captured_at: now_unix(),
            payload: RawPayload::Services(units),
        })
    }
}

fn parse_list_units(text: &str) -> Result<Vec<RawService>, String> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim_start_matches(['●', '*', ' ']);
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            return Err(format!("unexpected list-units line: '{line}'"));
        }
        let Some(name) = parts[0].strip_suffix(".service") else {
            continue;
        };
        out.push(RawService {
            name: name.to_string(),
            active_state: parts[2].to_string(),
            sub_state: parts[3].to_string(),
            active_for_us: None,
        });
    }
    Ok(out)
}

/// Parses `systemctl show` blocks (blank-line separated `Key=Value` lines).
fn parse_show_monotonic(text: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for block in text.split("\n\n") {
        let mut id = None;
        let mut enter = None;
        for line in block.lines() {
            if let Some(v) = line.strip_prefix("Id=") {
                id = v.strip_suffix(".service").map(str::to_string);
            } else if let Some(v) = line.strip_prefix("ActiveEnterTimestampMonotonic=") {
                enter = v.trim().parse::<u64>().ok();
            }
        }
        if let (Some(id), Some(enter)) = (id, enter) {
            out.insert(id, enter);
        }
    }
    out
}

async fn host_monotonic_us() -> Option<u64> {
    let text = tokio::fs::read_to_string("/proc/uptime").await.ok()?;
    parse_proc_uptime_us(&text)
}

fn parse_proc_uptime_us(text: &str) -> Option<u64> {
    let secs: f64 = text.split_whitespace().next()?.parse().ok()?;
    Some((secs * 1_000_000.0) as u64)
}
