//! axnc: runs the notification center and offers operator commands against it.

use axnc_rs::api::{AppState, router};
use axnc_rs::codes::CodeRegistry;
use axnc_rs::config::Config;
use axnc_rs::config::secrets::redact;
use axnc_rs::db::{Db, PgTransport};
use axnc_rs::directory::{HttpUserSource, UserDirectory};
use axnc_rs::handlers::{
    ArchiveHandler, ArchiveSink, ChannelHandler, ChatHandler, EmailHandler, FileSink,
    HandlerWorker, NotificationServiceSender, SlackApi, TokenCache, ToolsTokenSource,
    TracingSink, UiStoreHandler, WorkerConfig,
};
use axnc_rs::model::event::format_timestamp;
use axnc_rs::model::{Channel, Severity};
use axnc_rs::producer::{EventProducer, Produce, ProduceRequest};
use axnc_rs::rules::{RuleEngine, RuleManager};
use axnc_rs::store::{EventQuery, EventStore, RuleStore, SortOrder};
use axnc_rs::telemetry::{TelemetryConfig, init_telemetry};
use axnc_rs::transport::Transport;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(30);
const DIRECTORY_REFRESH: Duration = Duration::from_secs(60);
const RETENTION_SWEEP: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "axnc", about = "Notification center event pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the handlers and the management API
    Serve {
        /// Group members per channel handler
        #[arg(long, default_value_t = 1)]
        members: usize,
    },
    /// Produce an event
    Produce {
        /// Event code
        code: String,
        /// Trace id (defaults to the event id)
        #[arg(long)]
        trace_id: Option<String>,
        /// Explicit recipient, bypassing rules (repeatable)
        #[arg(long = "recipient")]
        recipients: Vec<String>,
        /// Detail entry as key=value (repeatable)
        #[arg(long = "detail", value_parser = parse_key_value)]
        detail: Vec<(String, String)>,
    },
    /// List the registered event codes
    Codes,
    /// Rule operations
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
    /// Stored event operations
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// List rules
    List {
        /// Filter by enabled flag
        #[arg(long)]
        enabled: Option<bool>,
    },
}

#[derive(Subcommand)]
enum EventsAction {
    /// List stored events, newest first
    List {
        #[arg(long)]
        channel: Option<Channel>,
        #[arg(long)]
        severity: Option<Severity>,
        #[arg(long)]
        facility: Option<String>,
        #[arg(long)]
        trace_id: Option<String>,
        #[arg(long)]
        recipient: Option<String>,
        /// Maximum events to show
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { members } => cmd_serve(members).await,
        Command::Codes => cmd_codes(),
        Command::Produce {
            code,
            trace_id,
            recipients,
            detail,
        } => {
            let config = Config::from_env()?;
            let db = connect(&config).await?;
            cmd_produce(&config, db, code, trace_id, recipients, detail).await
        }
        Command::Rules { action } => {
            let config = Config::from_env()?;
            let db = connect(&config).await?;
            match action {
                RulesAction::List { enabled } => cmd_rules_list(&db, enabled).await,
            }
        }
        Command::Events { action } => {
            let config = Config::from_env()?;
            let db = connect(&config).await?;
            match action {
                EventsAction::List {
                    channel,
                    severity,
                    facility,
                    trace_id,
                    recipient,
                    limit,
                } => {
                    let query = EventQuery {
                        channel,
                        severity,
                        facility,
                        trace_id,
                        recipient,
                        ordering: SortOrder::Desc,
                        limit: Some(limit),
                        ..Default::default()
                    };
                    cmd_events_list(&db, &query).await
                }
            }
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Db> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(db)
}

async fn load_directory(config: &Config) -> anyhow::Result<Arc<UserDirectory>> {
    let Some(url) = &config.user_directory_url else {
        return Ok(Arc::new(UserDirectory::empty()));
    };
    let directory = UserDirectory::new(Arc::new(HttpUserSource::new(url.clone(), OUTBOUND_TIMEOUT)?));
    if let Err(e) = directory.refresh().await {
        warn!("initial user directory load failed, starting empty: {e}");
    }
    Ok(Arc::new(directory))
}

fn build_producer(
    config: &Config,
    db: &Db,
    registry: Arc<CodeRegistry>,
    directory: Arc<UserDirectory>,
    transport: Arc<dyn Transport>,
) -> Arc<EventProducer> {
    let rule_store: Arc<dyn RuleStore> = Arc::new(db.clone());
    let engine = Arc::new(RuleEngine::new(rule_store, Arc::clone(&registry), directory));
    Arc::new(
        EventProducer::new(registry, engine, transport, config.cluster_name_id.clone())
            .with_substitutions(config.substitutions()),
    )
}

async fn cmd_serve(members: usize) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "axnc".to_string(),
        log_level: config.log_level.clone(),
    })?;
    info!(
        cluster = %config.cluster_name_id,
        database = %redact(&config.database_url),
        partitions = config.transport_partitions,
        "starting notification center"
    );

    let db = connect(&config).await?;
    let registry = Arc::new(CodeRegistry::embedded()?);
    let directory = load_directory(&config).await?;

    let worker_config = WorkerConfig {
        members,
        ..WorkerConfig::default()
    };
    let pg_transport = Arc::new(
        PgTransport::new(db.clone(), config.transport_partitions)
            .with_session_timeout(worker_config.session_timeout()),
    );
    let listener = pg_transport.listen().await?;
    let transport: Arc<dyn Transport> = pg_transport;

    let producer = build_producer(
        &config,
        &db,
        Arc::clone(&registry),
        Arc::clone(&directory),
        Arc::clone(&transport),
    );
    let event_store: Arc<dyn EventStore> = Arc::new(db.clone());

    let archive_sink: Arc<dyn ArchiveSink> = match &config.archive_log_path {
        Some(path) => Arc::new(FileSink::new(path)),
        None => Arc::new(TracingSink),
    };
    let handlers: Vec<Arc<dyn ChannelHandler>> = vec![
        Arc::new(EmailHandler::new(
            Arc::new(NotificationServiceSender::new(
                &config.notification_service_url,
                OUTBOUND_TIMEOUT,
            )?),
            producer.clone() as Arc<dyn Produce>,
        )),
        Arc::new(ChatHandler::new(
            TokenCache::new(Arc::new(ToolsTokenSource::new(
                &config.tools_service_url,
                OUTBOUND_TIMEOUT,
            )?)),
            Arc::new(SlackApi::new(&config.slack_api_url, OUTBOUND_TIMEOUT)?),
            producer.clone() as Arc<dyn Produce>,
        )),
        Arc::new(UiStoreHandler::new(Arc::clone(&event_store))),
        Arc::new(ArchiveHandler::new(archive_sink)),
    ];

    let workers: Vec<Arc<HandlerWorker>> = handlers
        .into_iter()
        .map(|h| {
            Arc::new(HandlerWorker::new(
                Arc::clone(&transport),
                h,
                worker_config.clone(),
            ))
        })
        .collect();
    let mut tasks = tokio::task::JoinSet::new();
    for worker in &workers {
        tasks.spawn(Arc::clone(worker).run());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let directory = Arc::clone(&directory);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { directory.run_refresh(DIRECTORY_REFRESH, rx).await });
    }
    tokio::spawn(run_retention(
        Arc::clone(&transport),
        config.transport_retention,
        shutdown_rx.clone(),
    ));

    let app = router(AppState {
        rules: RuleManager::new(Arc::new(db.clone()), Arc::clone(&registry)),
        events: event_store,
        registry,
    });
    let tcp = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "management API listening");

    let mut http_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(tcp, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    shutdown_tx.send_replace(true);
    for worker in &workers {
        worker.shutdown();
    }
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Err(e)) = joined {
            warn!("handler worker error: {e}");
        }
    }
    server.await??;
    listener.abort();
    Ok(())
}

async fn run_retention(
    transport: Arc<dyn Transport>,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = tokio::time::sleep(RETENTION_SWEEP) => {
                match transport.purge_expired(retention).await {
                    Ok(removed) => info!(removed, "transport retention sweep"),
                    Err(e) => warn!("transport retention sweep failed: {e}"),
                }
            }
        }
    }
}

fn cmd_codes() -> anyhow::Result<()> {
    let registry = CodeRegistry::embedded()?;
    println!(
        "{:<44}  {:<16}  {:<18}  {:<8}  MESSAGE",
        "CODE", "CHANNEL", "FACILITY", "SEVERITY"
    );
    println!("{}", "-".repeat(120));
    for binding in registry.all() {
        println!(
            "{:<44}  {:<16}  {:<18}  {:<8}  {}",
            binding.code, binding.channel, binding.facility, binding.severity, binding.template
        );
    }
    println!("\n{} code(s)", registry.len());
    Ok(())
}

async fn cmd_produce(
    config: &Config,
    db: Db,
    code: String,
    trace_id: Option<String>,
    recipients: Vec<String>,
    detail: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let registry = Arc::new(CodeRegistry::embedded()?);
    let directory = load_directory(config).await?;
    let transport: Arc<dyn Transport> =
        Arc::new(PgTransport::new(db.clone(), config.transport_partitions));
    let producer = build_producer(config, &db, registry, directory, transport);

    let mut request = ProduceRequest::new(code).recipients(recipients);
    if let Some(trace_id) = trace_id {
        request = request.trace_id(trace_id);
    }
    for (key, value) in detail {
        request = request.detail(key, value);
    }

    let id = producer.produce(request).await?;
    println!("Produced: {id}");
    Ok(())
}

async fn cmd_rules_list(db: &Db, enabled: Option<bool>) -> anyhow::Result<()> {
    let rules = db.list_rules(enabled).await?;
    if rules.is_empty() {
        println!("No rules found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<24}  {:<7}  {:<30}  {:<20}  RECIPIENTS",
        "ID", "NAME", "ENABLED", "CODES", "CHANNELS"
    );
    println!("{}", "-".repeat(120));
    for rule in &rules {
        let channels: Vec<&str> = rule.spec.channels.iter().map(|c| c.as_str()).collect();
        let codes = if rule.spec.codes.is_empty() {
            "*".to_string()
        } else {
            rule.spec.codes.join(",")
        };
        println!(
            "{:<8}  {:<24}  {:<7}  {:<30}  {:<20}  {}",
            &rule.rule_id.to_string()[..8],
            rule.spec.name,
            rule.spec.enabled,
            codes,
            channels.join(","),
            rule.spec.recipients.join(",")
        );
    }
    println!("\n{} rule(s)", rules.len());
    Ok(())
}

async fn cmd_events_list(db: &Db, query: &EventQuery) -> anyhow::Result<()> {
    let events = db.query_events(query).await?;
    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<36}  {:<8}  {:<23}  {:<12}  MESSAGE",
        "ID", "CODE", "SEVERITY", "TIME", "ACKED BY"
    );
    println!("{}", "-".repeat(120));
    for event in &events {
        println!(
            "{:<8}  {:<36}  {:<8}  {:<23}  {:<12}  {}",
            event.event_id.short(),
            event.code,
            event.severity,
            format_timestamp(event.timestamp),
            event.acknowledged_by.as_deref().unwrap_or("-"),
            event.message
        );
    }
    println!("\n{} event(s)", events.len());
    Ok(())
}
