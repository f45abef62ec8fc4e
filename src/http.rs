use crate::metrics::Metrics;
use crate::query::{QueryApi, QueryError};
use crate::report::ReportKind;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_TAIL_LINES: usize = 10;
const DEFAULT_SEARCH_HOURS: u64 = 24;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub api: QueryApi,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        let status = match err {
            QueryError::Validation(_) => StatusCode::BAD_REQUEST,
            QueryError::Collection(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct TailParams {
    service: Option<String>,
    lines: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    query: Option<String>,
    service: Option<String>,
    hours: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ReportParams {
    period: Option<String>,
}

pub fn build_router(metrics: Arc<Metrics>, api: QueryApi) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/system/status", get(system_status))
        .route("/api/system/services", get(services))
        .route("/api/system/services/:name", get(service))
        .route("/api/system/resources", get(resources))
        .route("/api/logs/tail", get(logs_tail))
        .route("/api/logs/search", get(logs_search))
        .route("/api/users", get(users))
        .route("/api/users/:name", get(user))
        .route("/api/sessions", get(sessions))
        .route("/api/audit/scan", get(audit_scan))
        .route("/api/audit/compliance", get(audit_compliance))
        .route("/api/report/:kind", get(report))
        .with_state(HttpAppState { metrics, api })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn system_status(State(state): State<HttpAppState>) -> Response {
    found(state.api.get_system_status().await, || {
        "no system snapshot collected yet".to_string()
    })
}

async fn resources(State(state): State<HttpAppState>) -> Response {
    found(state.api.get_resource_usage().await, || {
        "no resources snapshot collected yet".to_string()
    })
}

async fn services(State(state): State<HttpAppState>) -> Response {
    respond(state.api.list_services().await.map_err(ApiError::from).map(Json))
}

async fn service(State(state): State<HttpAppState>, Path(name): Path<String>) -> Response {
    found(state.api.get_service(&name).await, || {
        format!("service '{name}' not found")
    })
}

async fn logs_tail(State(state): State<HttpAppState>, Query(p): Query<TailParams>) -> Response {
    let lines = p.lines.unwrap_or(DEFAULT_TAIL_LINES);
    respond(
        state
            .api
            .tail_logs(p.service.as_deref(), lines)
            .await
            .map_err(ApiError::from)
            .map(Json),
    )
}

async fn logs_search(State(state): State<HttpAppState>, Query(p): Query<SearchParams>) -> Response {
    let hours = p.hours.unwrap_or(DEFAULT_SEARCH_HOURS);
    respond(
        state
            .api
            .search_logs(p.query.as_deref().unwrap_or(""), p.service.as_deref(), hours)
            .await
            .map_err(ApiError::from)
            .map(Json),
    )
}

async fn users(State(state): State<HttpAppState>) -> Response {
    respond(state.api.list_users().await.map_err(ApiError::from).map(Json))
}

async fn user(State(state): State<HttpAppState>, Path(name): Path<String>) -> Response {
    found(state.api.get_user(&name).await, || {
        format!("user '{name}' not found")
    })
}

async fn sessions(State(state): State<HttpAppState>) -> Response {
    respond(state.api.list_sessions().await.map_err(ApiError::from).map(Json))
}

async fn audit_scan(State(state): State<HttpAppState>) -> Response {
    let report = state.api.run_audit().await;
    state.metrics.set_audit(report.passed, report.total);
    Json(report).into_response()
}

async fn audit_compliance(State(state): State<HttpAppState>) -> Response {
    Json(state.api.run_compliance().await).into_response()
}

async fn report(
    State(state): State<HttpAppState>,
    Path(kind): Path<String>,
    Query(p): Query<ReportParams>,
) -> Response {
    let kind = match kind.parse::<ReportKind>() {
        Ok(kind) => kind,
        Err(msg) => return ApiError::bad_request(msg).into_response(),
    };
    respond(
        state
            .api
            .generate_report_data(kind, p.period.as_deref())
            .await
            .map_err(ApiError::from)
            .map(Json),
    )
}

fn found<T: Serialize>(
    result: Result<Option<T>, QueryError>,
    missing: impl FnOnce() -> String,
) -> Response {
    match result {
        Ok(Some(value)) => Json(value).into_response(),
        Ok(None) => ApiError::not_found(missing()).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

fn respond<T: Serialize>(result: ApiResult<T>) -> Response {
    match result {
        Ok(body) => body.into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::CollectionError;
    use crate::config::{RulesConfig, StoreConfig};
    use crate::model::{Domain, LifecycleState, ManagedStatus, Service, Snapshot};
    use crate::rules::RuleEngine;
    use crate::store::AggregationStore;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (Router, QueryApi, Arc<Metrics>) {
        let metrics = Metrics::new().expect("metrics");
        let api = QueryApi::new(
            Arc::new(AggregationStore::new(&StoreConfig::default())),
            Arc::new(RuleEngine::from_config(&RulesConfig::default())),
        );
        (build_router(metrics.clone(), api.clone()), api, metrics)
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (app, _, _) = app();
        let (status, body) = get(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime() {
        let (app, _, _) = app();
        let (status, body) = get(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("serverguard_uptime_seconds"));
    }

    #[tokio::test]
    async fn known_service_is_returned_and_unknown_is_404() {
        let (app, api, _) = app();
        api.store()
            .replace_services(vec![Service {
                name: "nginx".to_string(),
                state: LifecycleState::Active,
                status: ManagedStatus::Running,
                uptime_secs: Some(60),
            }])
            .await;
        api.store()
            .put(Snapshot::new(Domain::Services, 1, Default::default(), Vec::new()))
            .await;

        let (status, body) = get(app.clone(), "/api/system/services/nginx").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["state"], "active");
        assert_eq!(json["uptime_secs"], 60);

        let (status, body) = get(app, "/api/system/services/redis").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("service 'redis' not found"));
    }

    #[tokio::test]
    async fn bad_parameters_are_400() {
        let (app, _, _) = app();
        let (status, _) = get(app.clone(), "/api/logs/tail?lines=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(app.clone(), "/api/report/yearly").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(app, "/api/report/daily?period=soon").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn search_without_query_is_json_400() {
        let (app, _, _) = app();
        for uri in ["/api/logs/search", "/api/logs/search?service=nginx", "/api/logs/search?query="] {
            let (status, body) = get(app.clone(), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            let json: serde_json::Value = serde_json::from_str(&body).unwrap();
            assert_eq!(json["error"], "invalid request: query must not be empty");
        }
    }

    #[tokio::test]
    async fn collection_failure_is_503() {
        let (app, api, _) = app();
        api.store()
            .record_failure(CollectionError::timeout(Domain::Sessions))
            .await;
        let (status, body) = get(app.clone(), "/api/sessions").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("timeout"));

        let (status, body) = get(app, "/api/report/daily").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["unavailable"][0]["domain"], "sessions");
    }

    #[tokio::test]
    async fn audit_scan_updates_metrics() {
        let (app, _, metrics) = app();
        let (status, body) = get(app, "/api/audit/scan").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["total"], 8);
        assert_eq!(json["verdict"], "NEEDS ATTENTION");
        assert_eq!(metrics.serverguard_audit_checks_total.get(), 8.0);
    }
}
