use crate::collectors::CollectionError;
use crate::model::{now_unix, CheckResult, Domain, LogEntry, Service, Session, Snapshot, User};
use crate::rules::{AuditReport, RuleEngine};
use crate::store::AggregationStore;
use std::sync::Arc;
use thiserror::Error;

pub const MAX_TAIL_LINES: usize = 10_000;
pub const MAX_SEARCH_HOURS: u64 = 24 * 366;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    Collection(#[from] CollectionError),
}

/// Read-only entry point for every presentation layer. Absent identities are
/// `None`; a domain that has never been stored and whose last poll failed is
/// reported as the collection error.
#[derive(Clone)]
pub struct QueryApi {
    store: Arc<AggregationStore>,
    engine: Arc<RuleEngine>,
}

impl QueryApi {
    pub fn new(store: Arc<AggregationStore>, engine: Arc<RuleEngine>) -> Self {
        Self { store, engine }
    }

    pub fn store(&self) -> &Arc<AggregationStore> {
        &self.store
    }

    pub(crate) async fn ensure_available(&self, domain: Domain) -> Result<(), QueryError> {
        if self.store.latest(domain).await.is_some() {
            return Ok(());
        }
        match self.store.last_failure(domain).await {
            Some(err) => Err(QueryError::Collection(err)),
            None => Ok(()),
        }
    }

    async fn latest(&self, domain: Domain) -> Result<Option<Snapshot>, QueryError> {
        self.ensure_available(domain).await?;
        Ok(self.store.latest(domain).await)
    }

    pub async fn get_system_status(&self) -> Result<Option<Snapshot>, QueryError> {
        self.latest(Domain::System).await
    }

    pub async fn get_resource_usage(&self) -> Result<Option<Snapshot>, QueryError> {
        self.latest(Domain::Resources).await
    }

    pub async fn list_services(&self) -> Result<Vec<Service>, QueryError> {
        self.ensure_available(Domain::Services).await?;
        Ok(self.store.services().await)
    }

    pub async fn get_service(&self, name: &str) -> Result<Option<Service>, QueryError> {
        let name = non_empty("service name", name)?;
        self.ensure_available(Domain::Services).await?;
        Ok(self.store.service(name).await)
    }

    pub async fn tail_logs(
        &self,
        service: Option<&str>,
        lines: usize,
    ) -> Result<Vec<LogEntry>, QueryError> {
        if lines == 0 || lines > MAX_TAIL_LINES {
            return Err(QueryError::Validation(format!(
                "lines must be between 1 and {MAX_TAIL_LINES}"
            )));
        }
        let service = service.map(|s| non_empty("service", s)).transpose()?;
        self.ensure_available(Domain::Logs).await?;
        Ok(self.store.tail_logs(service, lines, now_unix()).await)
    }

    pub async fn search_logs(
        &self,
        query: &str,
        service: Option<&str>,
        hours: u64,
    ) -> Result<Vec<LogEntry>, QueryError> {
        if query.is_empty() {
            return Err(QueryError::Validation("query must not be empty".to_string()));
        }
        if hours == 0 || hours > MAX_SEARCH_HOURS {
            return Err(QueryError::Validation(format!(
                "hours must be between 1 and {MAX_SEARCH_HOURS}"
            )));
        }
        let service = service.map(|s| non_empty("service", s)).transpose()?;
        self.ensure_available(Domain::Logs).await?;
        Ok(self
            .store
            .search_logs(query, service, hours, now_unix())
            .await)
    }

    pub async fn list_users(&self) -> Result<Vec<User>, QueryError> {
        self.ensure_available(Domain::Users).await?;
        Ok(self.store.users().await)
    }

    pub async fn get_user(&self, name: &str) -> Result<Option<User>, QueryError> {
        let name = non_empty("username", name)?;
        self.ensure_available(Domain::Users).await?;
        Ok(self.store.user(name).await)
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, QueryError> {
        self.ensure_available(Domain::Sessions).await?;
        Ok(self.store.sessions().await)
    }

    pub async fn history(
        &self,
        domain: Domain,
        from: i64,
        to: i64,
    ) -> Result<Vec<Snapshot>, QueryError> {
        if from > to {
            return Err(QueryError::Validation(format!(
                "range start {from} is after its end {to}"
            )));
        }
        self.ensure_available(domain).await?;
        Ok(self.store.range(domain, from, to).await)
    }

    /// Missing inputs make the affected checks fail rather than the scan.
    pub async fn run_audit(&self) -> AuditReport {
        let view = self.store.view(now_unix()).await;
        self.engine.run_audit(&view)
    }

    pub async fn run_compliance(&self) -> Vec<CheckResult> {
        let view = self.store.view(now_unix()).await;
        self.engine.run_compliance(&view)
    }
}

fn non_empty<'a>(what: &str, value: &'a str) -> Result<&'a str, QueryError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(QueryError::Validation(format!("{what} must not be empty")))
    } else {
        Ok(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RulesConfig, StoreConfig};
    use crate::model::LogLevel;
    use crate::rules::SecurityRating;

    fn api() -> QueryApi {
        QueryApi::new(
            Arc::new(AggregationStore::new(&StoreConfig::default())),
            Arc::new(RuleEngine::from_config(&RulesConfig::default())),
        )
    }

    fn entry(ts: i64, service: &str, message: &str) -> LogEntry {
        LogEntry {
            timestamp: ts,
            level: LogLevel::Error,
            service: service.to_string(),
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn empty_store_yields_none_not_error() {
        let api = api();
        assert!(api.get_system_status().await.unwrap().is_none());
        assert!(api.list_services().await.unwrap().is_empty());
        assert!(api.get_user("admin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_first_poll_surfaces_collection_error() {
        let api = api();
        api.store()
            .record_failure(CollectionError::unavailable(Domain::Users, "no /etc/passwd"))
            .await;
        let err = api.list_users().await.unwrap_err();
        assert!(matches!(err, QueryError::Collection(ref e) if e.domain == Domain::Users));
        assert!(api.list_sessions().await.is_ok());
    }

    #[tokio::test]
    async fn stale_data_is_served_after_a_failed_poll() {
        let api = api();
        let snap = Snapshot::new(Domain::System, 5, Default::default(), Vec::new());
        api.store().put(snap.clone()).await;
        api.store()
            .record_failure(CollectionError::timeout(Domain::System))
            .await;
        assert_eq!(api.get_system_status().await.unwrap(), Some(snap));
    }

    #[tokio::test]
    async fn log_parameters_are_validated() {
        let api = api();
        assert!(matches!(
            api.tail_logs(None, 0).await,
            Err(QueryError::Validation(_))
        ));
        assert!(matches!(
            api.tail_logs(None, MAX_TAIL_LINES + 1).await,
            Err(QueryError::Validation(_))
        ));
        assert!(matches!(
            api.search_logs("", None, 24).await,
            Err(QueryError::Validation(_))
        ));
        assert!(matches!(
            api.search_logs("x", None, 0).await,
            Err(QueryError::Validation(_))
        ));
        assert!(matches!(
            api.tail_logs(Some("  "), 5).await,
            Err(QueryError::Validation(_))
        ));
        assert!(matches!(
            api.history(Domain::System, 10, 5).await,
            Err(QueryError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn search_filters_by_service_and_text() {
        let api = api();
        let now = now_unix();
        api.store()
            .append_logs(
                vec![
                    entry(now - 20, "app", "Failed to connect to API endpoint"),
                    entry(now - 10, "nginx", "Failed upstream"),
                    entry(now - 5, "app", "Connection timeout to API"),
                ],
                now,
            )
            .await;
        let hits = api.search_logs("API", Some("app"), 1).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].timestamp < hits[1].timestamp);
        assert!(api.search_logs("nothing", None, 1).await.unwrap().is_empty());
        let tail = api.tail_logs(Some("nginx"), 10).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn audit_over_empty_store_needs_attention() {
        let report = api().run_audit().await;
        assert_eq!(report.total, 8);
        assert_eq!(report.passed, 0);
        assert_eq!(report.verdict, SecurityRating::NeedsAttention);
        assert_eq!(api().run_compliance().await.len(), 6);
    }
}
