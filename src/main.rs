mod collectors;
mod config;
mod http;
mod metrics;
mod model;
mod normalizer;
mod poller;
mod query;
mod report;
mod rules;
mod store;

use axum::serve;
use clap::{Parser, Subcommand};
use collectors::{build_collectors, CollectionError};
use config::{Backend, Config, ConfigError};
use metrics::Metrics;
use model::Domain;
use normalizer::Normalizer;
use poller::Poller;
use query::{QueryApi, QueryError};
use report::ReportKind;
use rules::RuleEngine;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::AggregationStore;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "serverguard")]
#[command(version, about = "Host metrics, logs and security audit engine")]
struct Cli {
    /// YAML configuration file; built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<String>,
    /// Use the deterministic demo backend instead of the host.
    #[arg(long, global = true)]
    simulated: bool,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every domain on an interval and serve the HTTP API.
    Serve,
    /// System status, services and resource usage.
    System {
        #[command(subcommand)]
        cmd: SystemCmd,
    },
    /// Recent log entries and log search.
    Logs {
        #[command(subcommand)]
        cmd: LogsCmd,
    },
    /// Local accounts and logged-in sessions.
    Users {
        #[command(subcommand)]
        cmd: UsersCmd,
    },
    /// Security audit and compliance checks.
    Audit {
        #[command(subcommand)]
        cmd: AuditCmd,
    },
    /// Structured report data.
    Report {
        #[command(subcommand)]
        cmd: ReportCmd,
    },
}

#[derive(Subcommand, Debug)]
enum SystemCmd {
    Status,
    Services {
        /// Show a single service.
        name: Option<String>,
    },
    Resources,
}

#[derive(Subcommand, Debug)]
enum LogsCmd {
    Tail {
        #[arg(long)]
        service: Option<String>,
        #[arg(long, short = 'n', default_value_t = 10)]
        lines: usize,
    },
    Search {
        query: String,
        #[arg(long)]
        service: Option<String>,
        #[arg(long, default_value_t = 24)]
        hours: u64,
    },
}

#[derive(Subcommand, Debug)]
enum UsersCmd {
    List {
        /// Show a single user.
        name: Option<String>,
    },
    Sessions,
}

#[derive(Subcommand, Debug)]
enum AuditCmd {
    Scan,
    Compliance,
}

#[derive(Subcommand, Debug)]
enum ReportCmd {
    Generate {
        #[arg(value_parser = parse_report_kind)]
        kind: ReportKind,
        /// `last-24h`, `last-7d`, ...; defaults to the kind's natural period.
        #[arg(long)]
        period: Option<String>,
    },
}

fn parse_report_kind(raw: &str) -> Result<ReportKind, String> {
    raw.parse()
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("{0}")]
    NotFound(String),
    #[error("failed to initialize metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("invalid listen address '{addr}': {source}")]
    Listen {
        addr: String,
        source: std::net::AddrParseError,
    },
    #[error("http server: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode output: {0}")]
    Output(#[from] serde_json::Error),
}

impl AppError {
    fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) | AppError::Listen { .. } => 2,
            AppError::Query(QueryError::Validation(_)) => 2,
            _ => 1,
        }
    }
}

struct Engine {
    poller: Arc<Poller>,
    api: QueryApi,
    metrics: Arc<Metrics>,
}

impl Engine {
    fn build(cfg: &Config) -> Result<Self, AppError> {
        let metrics = Metrics::new()?;
        let store = Arc::new(AggregationStore::new(&cfg.store));
        let rules = Arc::new(RuleEngine::from_config(&cfg.rules));
        let poller = Arc::new(Poller::new(
            build_collectors(cfg),
            Normalizer::new(cfg.collectors.inactive_after_days),
            store.clone(),
            metrics.clone(),
            Duration::from_millis(cfg.poll_timeout_ms),
        ));
        Ok(Self {
            poller,
            api: QueryApi::new(store, rules),
            metrics,
        })
    }

    /// Failures are recorded in the store; queries report them when a domain
    /// ends up with no data at all.
    async fn poll(&self, domains: &[Domain]) -> Vec<CollectionError> {
        self.poller
            .poll_many(domains)
            .await
            .into_iter()
            .filter_map(|(_, outcome)| outcome.err())
            .collect()
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let serving = matches!(cli.command, None | Some(Command::Serve));
    init_tracing(if serving { "info" } else { "warn" });

    if let Err(err) = run(cli).await {
        error!(error = %err, "serverguard failed");
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    if cli.simulated {
        cfg.backend = Backend::Simulated;
    }
    cfg.validate()?;

    let engine = Engine::build(&cfg)?;
    match cli.command {
        None | Some(Command::Serve) => serve_daemon(cfg, engine).await,
        Some(Command::System { cmd }) => system_cmd(&engine, cmd).await,
        Some(Command::Logs { cmd }) => logs_cmd(&engine, cmd).await,
        Some(Command::Users { cmd }) => users_cmd(&engine, cmd).await,
        Some(Command::Audit { cmd }) => audit_cmd(&engine, cmd).await,
        Some(Command::Report { cmd }) => report_cmd(&engine, cmd).await,
    }
}

async fn system_cmd(engine: &Engine, cmd: SystemCmd) -> Result<(), AppError> {
    match cmd {
        SystemCmd::Status => {
            engine.poll(&[Domain::System]).await;
            let status = engine.api.get_system_status().await?;
            print_json(&required(status, "no system snapshot collected")?)
        }
        SystemCmd::Services { name: None } => {
            engine.poll(&[Domain::Services]).await;
            print_json(&engine.api.list_services().await?)
        }
        SystemCmd::Services { name: Some(name) } => {
            engine.poll(&[Domain::Services]).await;
            let service = engine.api.get_service(&name).await?;
            print_json(&required(service, &format!("service '{name}' not found"))?)
        }
        SystemCmd::Resources => {
            engine.poll(&[Domain::Resources]).await;
            let usage = engine.api.get_resource_usage().await?;
            print_json(&required(usage, "no resources snapshot collected")?)
        }
    }
}

async fn logs_cmd(engine: &Engine, cmd: LogsCmd) -> Result<(), AppError> {
    engine.poll(&[Domain::Logs]).await;
    match cmd {
        LogsCmd::Tail { service, lines } => {
            print_json(&engine.api.tail_logs(service.as_deref(), lines).await?)
        }
        LogsCmd::Search {
            query,
            service,
            hours,
        } => print_json(
            &engine
                .api
                .search_logs(&query, service.as_deref(), hours)
                .await?,
        ),
    }
}

async fn users_cmd(engine: &Engine, cmd: UsersCmd) -> Result<(), AppError> {
    match cmd {
        UsersCmd::List { name: None } => {
            engine.poll(&[Domain::Users]).await;
            print_json(&engine.api.list_users().await?)
        }
        UsersCmd::List { name: Some(name) } => {
            engine.poll(&[Domain::Users]).await;
            let user = engine.api.get_user(&name).await?;
            print_json(&required(user, &format!("user '{name}' not found"))?)
        }
        UsersCmd::Sessions => {
            engine.poll(&[Domain::Sessions]).await;
            print_json(&engine.api.list_sessions().await?)
        }
    }
}

const AUDIT_DOMAINS: [Domain; 4] = [
    Domain::System,
    Domain::Services,
    Domain::Resources,
    Domain::Users,
];

async fn audit_cmd(engine: &Engine, cmd: AuditCmd) -> Result<(), AppError> {
    for err in engine.poll(&AUDIT_DOMAINS).await {
        warn!(error = %err, "audit input unavailable");
    }
    match cmd {
        AuditCmd::Scan => print_json(&engine.api.run_audit().await),
        AuditCmd::Compliance => print_json(&engine.api.run_compliance().await),
    }
}

async fn report_cmd(engine: &Engine, cmd: ReportCmd) -> Result<(), AppError> {
    let ReportCmd::Generate { kind, period } = cmd;
    engine.poll(&Domain::ALL).await;
    print_json(
        &engine
            .api
            .generate_report_data(kind, period.as_deref())
            .await?,
    )
}

fn required<T>(value: Option<T>, missing: &str) -> Result<T, AppError> {
    value.ok_or_else(|| AppError::NotFound(missing.to_string()))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve_daemon(cfg: Config, engine: Engine) -> Result<(), AppError> {
    let addr: SocketAddr = cfg.listen.parse().map_err(|source| AppError::Listen {
        addr: cfg.listen.clone(),
        source,
    })?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        listen = %addr,
        interval_secs = cfg.interval_secs,
        backend = ?cfg.backend,
        audit_checks = engine.api.run_audit().await.total,
        "starting serverguard"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task: JoinHandle<Result<(), std::io::Error>> = {
        let app = http::build_router(engine.metrics.clone(), engine.api.clone());
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        })
    };

    let poll_task = {
        let poller = engine.poller.clone();
        let api = engine.api.clone();
        let metrics = engine.metrics.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(cfg.interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("poll loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let outcomes = poller.poll_many(&Domain::ALL).await;
                        let failed = outcomes.iter().filter(|(_, r)| r.is_err()).count();
                        let audit = api.run_audit().await;
                        metrics.set_audit(audit.passed, audit.total);
                        info!(
                            polled = outcomes.len(),
                            failed,
                            audit = %audit.verdict,
                            "poll cycle complete"
                        );
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    join_task(poll_task).await;
    match join_task(http_task).await {
        Some(Err(err)) => Err(AppError::Io(err)),
        _ => Ok(()),
    }
}

/// Re-raises a task panic on the caller.
async fn join_task<T>(handle: JoinHandle<T>) -> Option<T> {
    match handle.await {
        Ok(value) => Some(value),
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(err) => {
            warn!(error = %err, "task cancelled");
            None
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
