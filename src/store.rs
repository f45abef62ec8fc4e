use crate::collectors::CollectionError;
use crate::config::StoreConfig;
use crate::model::{Domain, LogEntry, Service, Session, Snapshot, User};
use std::collections::VecDeque;
use tokio::sync::RwLock;

const HOUR: i64 = 3600;

/// In-memory history of normalized data. Each domain ring and each entity
/// table sits behind its own lock, so a writer only blocks readers of the
/// same domain.
pub struct AggregationStore {
    capacity: usize,
    log_window_secs: i64,
    max_log_entries: usize,
    rings: [RwLock<VecDeque<Snapshot>>; Domain::ALL.len()],
    failures: [RwLock<Option<CollectionError>>; Domain::ALL.len()],
    services: RwLock<Vec<Service>>,
    users: RwLock<Vec<User>>,
    sessions: RwLock<Vec<Session>>,
    logs: RwLock<VecDeque<LogEntry>>,
}

/// Owned, point-in-time copy of what the rule engine reads. Table-backed
/// domains are `None` until their first successful poll.
#[derive(Debug, Clone, Default)]
pub struct StoreView {
    pub now: i64,
    pub system: Option<Snapshot>,
    pub resources: Option<Snapshot>,
    pub services: Option<Vec<Service>>,
    pub users: Option<Vec<User>>,
}

impl AggregationStore {
    pub fn new(cfg: &StoreConfig) -> Self {
        Self {
            capacity: cfg.snapshot_capacity.max(1),
            log_window_secs: (cfg.log_window_hours as i64).saturating_mul(HOUR),
            max_log_entries: cfg.max_log_entries.max(1),
            rings: std::array::from_fn(|_| RwLock::new(VecDeque::new())),
            failures: std::array::from_fn(|_| RwLock::new(None)),
            services: RwLock::new(Vec::new()),
            users: RwLock::new(Vec::new()),
            sessions: RwLock::new(Vec::new()),
            logs: RwLock::new(VecDeque::new()),
        }
    }

    fn ring(&self, domain: Domain) -> &RwLock<VecDeque<Snapshot>> {
        &self.rings[domain as usize]
    }

    /// Inserts in `captured_at` order. A snapshot for an instant already held
    /// replaces the stored one; past capacity the oldest is evicted.
    pub async fn put(&self, snapshot: Snapshot) {
        let mut ring = self.ring(snapshot.domain()).write().await;
        let at = snapshot.captured_at();
        match ring.back() {
            None => ring.push_back(snapshot),
            Some(last) if last.captured_at() < at => ring.push_back(snapshot),
            Some(_) => match ring.binary_search_by_key(&at, Snapshot::captured_at) {
                Ok(idx) => ring[idx] = snapshot,
                Err(idx) => ring.insert(idx, snapshot),
            },
        }
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    pub async fn latest(&self, domain: Domain) -> Option<Snapshot> {
        self.ring(domain).read().await.back().cloned()
    }

    /// Snapshots with `from <= captured_at <= to`, oldest first.
    pub async fn range(&self, domain: Domain, from: i64, to: i64) -> Vec<Snapshot> {
        if from > to {
            return Vec::new();
        }
        let ring = self.ring(domain).read().await;
        let start = ring.partition_point(|s| s.captured_at() < from);
        let end = ring.partition_point(|s| s.captured_at() <= to);
        ring.range(start..end).cloned().collect()
    }

    pub async fn snapshot_count(&self, domain: Domain) -> usize {
        self.ring(domain).read().await.len()
    }

    pub async fn replace_services(&self, rows: Vec<Service>) {
        *self.services.write().await = rows;
    }

    pub async fn replace_users(&self, rows: Vec<User>) {
        *self.users.write().await = rows;
    }

    pub async fn replace_sessions(&self, rows: Vec<Session>) {
        *self.sessions.write().await = rows;
    }

    pub async fn services(&self) -> Vec<Service> {
        self.services.read().await.clone()
    }

    pub async fn service(&self, name: &str) -> Option<Service> {
        self.services
            .read()
            .await
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    pub async fn users(&self) -> Vec<User> {
        self.users.read().await.clone()
    }

    pub async fn user(&self, name: &str) -> Option<User> {
        self.users
            .read()
            .await
            .iter()
            .find(|u| u.username == name)
            .cloned()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.sessions.read().await.clone()
    }

    /// Keeps the buffer in timestamp order, then drops entries older than the
    /// retention window (relative to `now`) and trims to the entry cap.
    pub async fn append_logs(&self, entries: Vec<LogEntry>, now: i64) {
        let mut logs = self.logs.write().await;
        for entry in entries {
            match logs.back() {
                Some(last) if last.timestamp > entry.timestamp => {
                    let idx = logs.partition_point(|e| e.timestamp <= entry.timestamp);
                    logs.insert(idx, entry);
                }
                _ => logs.push_back(entry),
            }
        }
        let cutoff = self.window_start(now);
        while logs.front().is_some_and(|e| e.timestamp < cutoff) {
            logs.pop_front();
        }
        while logs.len() > self.max_log_entries {
            logs.pop_front();
        }
    }

    pub async fn log_count(&self) -> usize {
        self.logs.read().await.len()
    }

    /// Oldest timestamp still inside the retention window at `now`.
    fn window_start(&self, now: i64) -> i64 {
        now.saturating_sub(self.log_window_secs)
    }

    /// Case-sensitive substring match over the last `since_hours` hours.
    pub async fn search_logs(
        &self,
        query: &str,
        service: Option<&str>,
        since_hours: u64,
        now: i64,
    ) -> Vec<LogEntry> {
        let since = now.saturating_sub((since_hours as i64).saturating_mul(HOUR));
        let cutoff = since.max(self.window_start(now));
        let logs = self.logs.read().await;
        let start = logs.partition_point(|e| e.timestamp < cutoff);
        logs.range(start..)
            .filter(|e| service.map_or(true, |s| e.service == s))
            .filter(|e| e.message.contains(query))
            .cloned()
            .collect()
    }

    /// The last `lines` entries still inside the retention window (optionally
    /// for one service), oldest first.
    pub async fn tail_logs(
        &self,
        service: Option<&str>,
        lines: usize,
        now: i64,
    ) -> Vec<LogEntry> {
        let cutoff = self.window_start(now);
        let logs = self.logs.read().await;
        let mut out: Vec<LogEntry> = logs
            .iter()
            .rev()
            .take_while(|e| e.timestamp >= cutoff)
            .filter(|e| service.map_or(true, |s| e.service == s))
            .take(lines)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Entries at or after `since`, never older than the retention window.
    pub async fn logs_since(&self, since: i64, now: i64) -> Vec<LogEntry> {
        let cutoff = since.max(self.window_start(now));
        let logs = self.logs.read().await;
        let start = logs.partition_point(|e| e.timestamp < cutoff);
        logs.range(start..).cloned().collect()
    }

    pub async fn record_failure(&self, err: CollectionError) {
        let idx = err.domain as usize;
        *self.failures[idx].write().await = Some(err);
    }

    pub async fn clear_failure(&self, domain: Domain) {
        *self.failures[domain as usize].write().await = None;
    }

    pub async fn last_failure(&self, domain: Domain) -> Option<CollectionError> {
        self.failures[domain as usize].read().await.clone()
    }

    pub async fn view(&self, now: i64) -> StoreView {
        let collected = |snap: Option<Snapshot>| snap.is_some();
        let services = if collected(self.latest(Domain::Services).await) {
            Some(self.services().await)
        } else {
            None
        };
        let users = if collected(self.latest(Domain::Users).await) {
            Some(self.users().await)
        } else {
            None
        };
        StoreView {
            now,
            system: self.latest(Domain::System).await,
            resources: self.latest(Domain::Resources).await,
            services,
            users,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldValue, LogLevel};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn store(capacity: usize) -> AggregationStore {
        AggregationStore::new(&StoreConfig {
            snapshot_capacity: capacity,
            log_window_hours: 24,
            max_log_entries: 5,
        })
    }

    fn snap(domain: Domain, at: i64, cpu: f64) -> Snapshot {
        let mut fields = BTreeMap::new();
        fields.insert("cpu.usage_percent".to_string(), FieldValue::Number(cpu));
        Snapshot::new(domain, at, fields, Vec::new())
    }

    fn entry(ts: i64, service: &str, message: &str) -> LogEntry {
        LogEntry {
            timestamp: ts,
            level: LogLevel::Info,
            service: service.to_string(),
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn latest_returns_last_put() {
        let store = store(10);
        assert!(store.latest(Domain::System).await.is_none());
        store.put(snap(Domain::System, 100, 1.0)).await;
        store.put(snap(Domain::System, 200, 2.0)).await;
        let latest = store.latest(Domain::System).await.unwrap();
        assert_eq!(latest.captured_at(), 200);
        assert!(store.latest(Domain::Resources).await.is_none());
    }

    #[tokio::test]
    async fn ring_evicts_oldest_past_capacity() {
        let store = store(3);
        for at in 1..=4 {
            store.put(snap(Domain::Resources, at, at as f64)).await;
        }
        assert_eq!(store.snapshot_count(Domain::Resources).await, 3);
        let all = store.range(Domain::Resources, 0, 100).await;
        let instants: Vec<i64> = all.iter().map(Snapshot::captured_at).collect();
        assert_eq!(instants, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn same_instant_overwrites() {
        let store = store(10);
        store.put(snap(Domain::System, 100, 1.0)).await;
        store.put(snap(Domain::System, 200, 2.0)).await;
        store.put(snap(Domain::System, 100, 9.0)).await;
        let all = store.range(Domain::System, 0, 1000).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].number("cpu.usage_percent"), Some(9.0));
    }

    #[tokio::test]
    async fn out_of_order_put_keeps_range_sorted() {
        let store = store(10);
        store.put(snap(Domain::System, 300, 0.0)).await;
        store.put(snap(Domain::System, 100, 0.0)).await;
        store.put(snap(Domain::System, 200, 0.0)).await;
        let instants: Vec<i64> = store
            .range(Domain::System, 100, 200)
            .await
            .iter()
            .map(Snapshot::captured_at)
            .collect();
        assert_eq!(instants, vec![100, 200]);
        assert!(store.range(Domain::System, 500, 100).await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_puts_at_same_instant_leave_one() {
        let store = Arc::new(store(10));
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.put(snap(Domain::System, 500, i as f64)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let all = store.range(Domain::System, 500, 500).await;
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn tail_returns_last_lines_in_order() {
        let store = store(10);
        let entries = (1..=5).map(|i| entry(i, "app", &format!("m{i}"))).collect();
        store.append_logs(entries, 5).await;
        let tail = store.tail_logs(None, 3, 5).await;
        let messages: Vec<&str> = tail.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["m3", "m4", "m5"]);
    }

    #[tokio::test]
    async fn search_is_case_sensitive_and_chronological() {
        let store = store(10);
        let now = 10 * HOUR;
        store
            .append_logs(
                vec![
                    entry(now - 2, "app", "Failed to connect"),
                    entry(now - 5, "app", "Failed to bind"),
                    entry(now - 1, "nginx", "failed upstream"),
                    entry(now - 3 * HOUR, "app", "Failed long ago"),
                ],
                now,
            )
            .await;

        let hits = store.search_logs("Failed", None, 1, now).await;
        let messages: Vec<&str> = hits.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["Failed to bind", "Failed to connect"]);

        let hits = store.search_logs("failed", Some("app"), 24, now).await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn log_buffer_respects_window_and_cap() {
        let store = store(10);
        let now = 100 * HOUR;
        store.append_logs(vec![entry(now - 25 * HOUR, "a", "old")], now).await;
        assert_eq!(store.log_count().await, 0);

        let entries = (0..8).map(|i| entry(now - 8 + i, "a", "x")).collect();
        store.append_logs(entries, now).await;
        assert_eq!(store.log_count().await, 5);
        assert_eq!(store.tail_logs(None, 1, now).await[0].timestamp, now - 1);
    }

    #[tokio::test]
    async fn reads_skip_entries_that_aged_out() {
        let store = store(10);
        let t0 = 10 * HOUR;
        store
            .append_logs(
                vec![entry(t0 - 1, "app", "Failed early"), entry(t0, "app", "Failed late")],
                t0,
            )
            .await;
        assert_eq!(store.tail_logs(None, 10, t0).await.len(), 2);

        let later = t0 + 48 * HOUR;
        assert!(store.tail_logs(None, 10, later).await.is_empty());
        assert!(store.logs_since(0, later).await.is_empty());
        assert!(store.search_logs("Failed", None, 72, later).await.is_empty());

        let edge = t0 + 24 * HOUR;
        let kept = store.tail_logs(None, 10, edge).await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].message, "Failed late");
    }

    #[tokio::test]
    async fn view_marks_uncollected_tables() {
        let store = store(10);
        store
            .replace_services(vec![Service {
                name: "nginx".to_string(),
                state: crate::model::LifecycleState::Active,
                status: crate::model::ManagedStatus::Running,
                uptime_secs: Some(1),
            }])
            .await;
        store.put(Snapshot::new(Domain::Services, 10, BTreeMap::new(), vec![])).await;
        let view = store.view(10).await;
        assert_eq!(view.services.map(|s| s.len()), Some(1));
        assert!(view.users.is_none());
        assert!(view.system.is_none());
        assert!(store.service("nginx").await.is_some());
        assert!(store.service("redis").await.is_none());
    }

    #[tokio::test]
    async fn failures_are_recorded_per_domain() {
        let store = store(10);
        store.record_failure(CollectionError::timeout(Domain::Logs)).await;
        assert!(store.last_failure(Domain::Logs).await.is_some());
        assert!(store.last_failure(Domain::Users).await.is_none());
        store.clear_failure(Domain::Logs).await;
        assert!(store.last_failure(Domain::Logs).await.is_none());
    }
}
