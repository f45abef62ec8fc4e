use crate::collectors::{CollectionError, Collector};
use crate::metrics::Metrics;
use crate::model::{Domain, Entities, Snapshot};
use crate::normalizer::Normalizer;
use crate::store::AggregationStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Runs collect, normalize and store for one domain at a time. Polls of the
/// same domain are serialized; different domains run independently.
pub struct Poller {
    collectors: [Option<Arc<dyn Collector>>; Domain::ALL.len()],
    in_flight: [Mutex<()>; Domain::ALL.len()],
    normalizer: Normalizer,
    store: Arc<AggregationStore>,
    metrics: Arc<Metrics>,
    timeout: Duration,
}

impl Poller {
    pub fn new(
        collectors: Vec<Arc<dyn Collector>>,
        normalizer: Normalizer,
        store: Arc<AggregationStore>,
        metrics: Arc<Metrics>,
        timeout: Duration,
    ) -> Self {
        let mut slots: [Option<Arc<dyn Collector>>; Domain::ALL.len()] =
            std::array::from_fn(|_| None);
        for c in collectors {
            let idx = c.domain() as usize;
            slots[idx] = Some(c);
        }
        Self {
            collectors: slots,
            in_flight: std::array::from_fn(|_| Mutex::new(())),
            normalizer,
            store,
            metrics,
            timeout,
        }
    }

    pub async fn poll(&self, domain: Domain) -> Result<Snapshot, CollectionError> {
        let _guard = self.in_flight[domain as usize].lock().await;
        let started = Instant::now();

        match self.collect_and_store(domain).await {
            Ok(snapshot) => {
                let secs = started.elapsed().as_secs_f64();
                self.store.clear_failure(domain).await;
                self.metrics.record_poll(domain, "ok", secs);
                self.metrics.update_from_snapshot(&snapshot);
                self.metrics.set_store_sizes(
                    domain,
                    self.store.snapshot_count(domain).await,
                    self.store.log_count().await,
                );
                debug!(domain = %domain, elapsed_ms = started.elapsed().as_millis() as u64, "poll complete");
                Ok(snapshot)
            }
            Err(err) => {
                warn!(domain = %domain, error = %err, "poll failed");
                self.metrics
                    .record_poll(domain, "error", started.elapsed().as_secs_f64());
                self.metrics.inc_collect_error(domain, err.cause.label());
                self.store.record_failure(err.clone()).await;
                Err(err)
            }
        }
    }

    async fn collect_and_store(&self, domain: Domain) -> Result<Snapshot, CollectionError> {
        let collector = self.collectors[domain as usize]
            .as_ref()
            .ok_or_else(|| CollectionError::unavailable(domain, "no collector configured"))?;

        let sample = tokio::time::timeout(self.timeout, collector.collect())
            .await
            .map_err(|_| CollectionError::timeout(domain))??;
        if sample.domain != domain {
            return Err(CollectionError::malformed(
                domain,
                format!("collector returned a {} sample", sample.domain),
            ));
        }

        let captured_at = sample.captured_at;
        let normalized = self.normalizer.normalize(sample);
        let warnings = normalized.snapshot.warnings().len();
        if normalized.snapshot.is_degraded() {
            warn!(domain = %domain, warnings, "snapshot degraded by normalization");
        }
        self.metrics.add_normalization_warnings(domain, warnings);

        match normalized.entities {
            Entities::None => {}
            Entities::Services(rows) => self.store.replace_services(rows).await,
            Entities::Users(rows) => self.store.replace_users(rows).await,
            Entities::Sessions(rows) => self.store.replace_sessions(rows).await,
            Entities::Logs(rows) => self.store.append_logs(rows, captured_at).await,
        }
        self.store.put(normalized.snapshot.clone()).await;
        Ok(normalized.snapshot)
    }

    /// Polls each domain on its own task and returns the outcomes in domain
    /// order. A panicking collector task propagates its panic.
    pub async fn poll_many(
        self: &Arc<Self>,
        domains: &[Domain],
    ) -> Vec<(Domain, Result<Snapshot, CollectionError>)> {
        let mut set = JoinSet::new();
        for &domain in domains {
            let poller = Arc::clone(self);
            set.spawn(async move { (domain, poller.poll(domain).await) });
        }

        let mut out = Vec::with_capacity(domains.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => out.push(outcome),
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(err) => warn!(error = %err, "poll task cancelled"),
            }
        }
        out.sort_by_key(|(domain, _)| *domain);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::simulated::SimulatedCollector;
    use crate::collectors::{CollectionCause, RawPayload, RawSample};
    use crate::config::{RulesConfig, StoreConfig};
    use crate::model::{EnumValue, FieldValue, LifecycleState, LogEntry, LogLevel, Verdict};
    use crate::rules::{RuleEngine, SecurityRating};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn poller(
        collectors: Vec<Arc<dyn Collector>>,
        timeout_ms: u64,
    ) -> (Arc<Poller>, Arc<AggregationStore>) {
        let store = Arc::new(AggregationStore::new(&StoreConfig::default()));
        let poller = Arc::new(Poller::new(
            collectors,
            Normalizer::new(30),
            store.clone(),
            Metrics::new().expect("metrics"),
            Duration::from_millis(timeout_ms),
        ));
        (poller, store)
    }

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Collector for Flaky {
        fn domain(&self) -> Domain {
            Domain::Sessions
        }

        async fn collect(&self) -> Result<RawSample, CollectionError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(CollectionError::malformed(Domain::Sessions, "garbled"));
            }
            Ok(RawSample {
                domain: Domain::Sessions,
                captured_at: 10,
                payload: RawPayload::Sessions(Vec::new()),
            })
        }
    }

    struct Counting {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Collector for Counting {
        fn domain(&self) -> Domain {
            Domain::Resources
        }

        async fn collect(&self) -> Result<RawSample, CollectionError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(RawSample {
                domain: Domain::Resources,
                captured_at: 1,
                payload: RawPayload::Metrics(Vec::new()),
            })
        }
    }

    #[tokio::test]
    async fn simulated_poll_lands_in_store() {
        let (p, store) = poller(vec![Arc::new(SimulatedCollector::new(Domain::Services))], 1000);
        let snap = p.poll(Domain::Services).await.unwrap();
        assert_eq!(snap.number("services.total"), Some(7.0));
        assert_eq!(store.services().await.len(), 7);
        assert_eq!(
            store.latest(Domain::Services).await.map(|s| s.captured_at()),
            Some(snap.captured_at())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn logs_timeout_leaves_prior_logs_untouched() {
        let slow = SimulatedCollector::new(Domain::Logs).with_latency(Duration::from_millis(500));
        let (p, store) = poller(vec![Arc::new(slow)], 50);
        let prior = LogEntry {
            timestamp: crate::model::now_unix(),
            level: LogLevel::Info,
            service: "app".to_string(),
            message: "kept".to_string(),
        };
        store.append_logs(vec![prior.clone()], prior.timestamp).await;

        let err = p.poll(Domain::Logs).await.unwrap_err();
        assert_eq!(err.domain, Domain::Logs);
        assert_eq!(err.cause, CollectionCause::Timeout);
        assert_eq!(store.tail_logs(None, 10, prior.timestamp).await, vec![prior]);
        assert!(store.latest(Domain::Logs).await.is_none());
        assert_eq!(store.last_failure(Domain::Logs).await, Some(err));
    }

    #[tokio::test]
    async fn success_clears_recorded_failure() {
        let (p, store) = poller(
            vec![Arc::new(Flaky {
                calls: AtomicUsize::new(0),
            })],
            1000,
        );
        assert!(p.poll(Domain::Sessions).await.is_err());
        assert!(store.last_failure(Domain::Sessions).await.is_some());
        assert!(p.poll(Domain::Sessions).await.is_ok());
        assert!(store.last_failure(Domain::Sessions).await.is_none());
    }

    #[tokio::test]
    async fn missing_collector_is_unavailable() {
        let (p, _) = poller(Vec::new(), 1000);
        let err = p.poll(Domain::Users).await.unwrap_err();
        assert!(matches!(err.cause, CollectionCause::Unavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_of_one_domain_do_not_overlap() {
        let counting = Arc::new(Counting {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let (p, _) = poller(vec![counting.clone() as Arc<dyn Collector>], 1000);
        let outcomes = p.poll_many(&[Domain::Resources; 4]).await;
        assert_eq!(outcomes.len(), 4);
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(counting.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_many_covers_every_domain() {
        let collectors = Domain::ALL
            .iter()
            .map(|d| Arc::new(SimulatedCollector::new(*d)) as Arc<dyn Collector>)
            .collect();
        let (p, store) = poller(collectors, 1000);
        let outcomes = p.poll_many(&Domain::ALL).await;
        let domains: Vec<Domain> = outcomes.iter().map(|(d, _)| *d).collect();
        assert_eq!(domains, Domain::ALL.to_vec());
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(store.log_count().await, 7);
    }

    #[tokio::test]
    async fn simulated_host_feeds_the_rule_engine() {
        let collectors = Domain::ALL
            .iter()
            .map(|d| Arc::new(SimulatedCollector::new(*d)) as Arc<dyn Collector>)
            .collect();
        let (p, store) = poller(collectors, 1000);
        p.poll_many(&Domain::ALL).await;

        let services = store.latest(Domain::Services).await.unwrap();
        assert_eq!(
            services.field("service.ufw.state"),
            Some(&FieldValue::Enum(EnumValue::Lifecycle(LifecycleState::Inactive)))
        );

        let engine = RuleEngine::from_config(&RulesConfig::default());
        let view = store.view(crate::model::now_unix()).await;
        let audit = engine.run_audit(&view);
        assert_eq!((audit.passed, audit.total), (6, 8));
        assert_eq!(audit.verdict, SecurityRating::Good);
        assert_eq!(audit.results[5].verdict, Verdict::Pass);

        let encryption = &engine.run_compliance(&view)[4];
        assert_eq!(encryption.name, "Encryption");
        assert_eq!(encryption.verdict, Verdict::Fail);
        assert_eq!(encryption.evidence, "/data not encrypted");
    }
}
