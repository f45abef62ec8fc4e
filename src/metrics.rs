use crate::model::{now_unix, Domain, Snapshot};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    started_at_unix: i64,
    pub serverguard_polls_total: CounterVec,
    pub serverguard_collect_errors_total: CounterVec,
    pub serverguard_normalization_warnings_total: CounterVec,
    pub serverguard_poll_duration_seconds: GaugeVec,
    pub serverguard_last_poll_timestamp_seconds: GaugeVec,
    pub serverguard_stored_snapshots: GaugeVec,
    pub serverguard_stored_log_entries: Gauge,
    pub serverguard_cpu_usage_percent: Gauge,
    pub serverguard_memory_used_gb: Gauge,
    pub serverguard_memory_usage_percent: Gauge,
    pub serverguard_disk_usage_percent: GaugeVec,
    pub serverguard_audit_checks_passed: Gauge,
    pub serverguard_audit_checks_total: Gauge,
    pub serverguard_uptime_seconds: Gauge,
    pub serverguard_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let serverguard_polls_total = CounterVec::new(
            opts!("serverguard_polls_total", "Completed polls by domain and outcome"),
            &["domain", "outcome"],
        )?;
        let serverguard_collect_errors_total = CounterVec::new(
            opts!(
                "serverguard_collect_errors_total",
                "Collection failures by domain and cause"
            ),
            &["domain", "cause"],
        )?;
        let serverguard_normalization_warnings_total = CounterVec::new(
            opts!(
                "serverguard_normalization_warnings_total",
                "Fields or rows skipped during normalization"
            ),
            &["domain"],
        )?;
        let serverguard_poll_duration_seconds = GaugeVec::new(
            opts!(
                "serverguard_poll_duration_seconds",
                "Duration of the last poll per domain"
            ),
            &["domain"],
        )?;
        let serverguard_last_poll_timestamp_seconds = GaugeVec::new(
            opts!(
                "serverguard_last_poll_timestamp_seconds",
                "Unix time of the last successful poll per domain"
            ),
            &["domain"],
        )?;
        let serverguard_stored_snapshots = GaugeVec::new(
            opts!(
                "serverguard_stored_snapshots",
                "Snapshots currently held per domain"
            ),
            &["domain"],
        )?;
        let serverguard_stored_log_entries = Gauge::with_opts(opts!(
            "serverguard_stored_log_entries",
            "Log entries currently held"
        ))?;
        let serverguard_cpu_usage_percent = Gauge::with_opts(opts!(
            "serverguard_cpu_usage_percent",
            "Host CPU usage from the latest system snapshot (0..100)"
        ))?;
        let serverguard_memory_used_gb = Gauge::with_opts(opts!(
            "serverguard_memory_used_gb",
            "Host memory in use in GB"
        ))?;
        let serverguard_memory_usage_percent = Gauge::with_opts(opts!(
            "serverguard_memory_usage_percent",
            "Host memory usage in percent (0..100)"
        ))?;
        let serverguard_disk_usage_percent = GaugeVec::new(
            opts!(
                "serverguard_disk_usage_percent",
                "Disk usage per mount point in percent (0..100)"
            ),
            &["mount"],
        )?;
        let serverguard_audit_checks_passed = Gauge::with_opts(opts!(
            "serverguard_audit_checks_passed",
            "Audit checks passed in the last scan"
        ))?;
        let serverguard_audit_checks_total = Gauge::with_opts(opts!(
            "serverguard_audit_checks_total",
            "Audit checks evaluated in the last scan"
        ))?;
        let serverguard_uptime_seconds = Gauge::with_opts(opts!(
            "serverguard_uptime_seconds",
            "Seconds since the daemon started"
        ))?;
        let serverguard_scrape_count_total = Counter::with_opts(opts!(
            "serverguard_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &serverguard_polls_total)?;
        register(&registry, &serverguard_collect_errors_total)?;
        register(&registry, &serverguard_normalization_warnings_total)?;
        register(&registry, &serverguard_poll_duration_seconds)?;
        register(&registry, &serverguard_last_poll_timestamp_seconds)?;
        register(&registry, &serverguard_stored_snapshots)?;
        register(&registry, &serverguard_stored_log_entries)?;
        register(&registry, &serverguard_cpu_usage_percent)?;
        register(&registry, &serverguard_memory_used_gb)?;
        register(&registry, &serverguard_memory_usage_percent)?;
        register(&registry, &serverguard_disk_usage_percent)?;
        register(&registry, &serverguard_audit_checks_passed)?;
        register(&registry, &serverguard_audit_checks_total)?;
        register(&registry, &serverguard_uptime_seconds)?;
        register(&registry, &serverguard_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            started_at_unix: now_unix(),
            serverguard_polls_total,
            serverguard_collect_errors_total,
            serverguard_normalization_warnings_total,
            serverguard_poll_duration_seconds,
            serverguard_last_poll_timestamp_seconds,
            serverguard_stored_snapshots,
            serverguard_stored_log_entries,
            serverguard_cpu_usage_percent,
            serverguard_memory_used_gb,
            serverguard_memory_usage_percent,
            serverguard_disk_usage_percent,
            serverguard_audit_checks_passed,
            serverguard_audit_checks_total,
            serverguard_uptime_seconds,
            serverguard_scrape_count_total,
        }))
    }

    pub fn record_poll(&self, domain: Domain, outcome: &str, secs: f64) {
        self.serverguard_polls_total
            .with_label_values(&[domain.as_str(), outcome])
            .inc();
        self.serverguard_poll_duration_seconds
            .with_label_values(&[domain.as_str()])
            .set(secs);
    }

    pub fn inc_collect_error(&self, domain: Domain, cause: &str) {
        self.serverguard_collect_errors_total
            .with_label_values(&[domain.as_str(), cause])
            .inc();
    }

    pub fn add_normalization_warnings(&self, domain: Domain, count: usize) {
        if count > 0 {
            self.serverguard_normalization_warnings_total
                .with_label_values(&[domain.as_str()])
                .inc_by(count as f64);
        }
    }

    pub fn set_store_sizes(&self, domain: Domain, snapshots: usize, log_entries: usize) {
        self.serverguard_stored_snapshots
            .with_label_values(&[domain.as_str()])
            .set(snapshots as f64);
        self.serverguard_stored_log_entries.set(log_entries as f64);
    }

    /// Mirrors host gauges from a freshly stored system or resources snapshot.
    pub fn update_from_snapshot(&self, snapshot: &Snapshot) {
        self.serverguard_last_poll_timestamp_seconds
            .with_label_values(&[snapshot.domain().as_str()])
            .set(snapshot.captured_at() as f64);

        match snapshot.domain() {
            Domain::System => {
                if let Some(v) = snapshot.number("cpu.usage_percent") {
                    self.serverguard_cpu_usage_percent.set(v);
                }
            }
            Domain::Resources => {
                if let Some(v) = snapshot.number("memory.used_gb") {
                    self.serverguard_memory_used_gb.set(v);
                }
                if let Some(v) = snapshot.number("memory.usage_percent") {
                    self.serverguard_memory_usage_percent.set(v);
                }
                self.serverguard_disk_usage_percent.reset();
                for (name, value) in snapshot.fields() {
                    let mount = name
                        .strip_prefix("disk.")
                        .and_then(|rest| rest.strip_suffix(".usage_percent"));
                    if let (Some(mount), Some(v)) = (mount, value.as_number()) {
                        self.serverguard_disk_usage_percent
                            .with_label_values(&[mount])
                            .set(v);
                    }
                }
            }
            _ => {}
        }
    }

    pub fn set_audit(&self, passed: usize, total: usize) {
        self.serverguard_audit_checks_passed.set(passed as f64);
        self.serverguard_audit_checks_total.set(total as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.serverguard_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        self.serverguard_uptime_seconds
            .set(now_unix().saturating_sub(self.started_at_unix) as f64);
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
