use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use herald_agent::{CostLedger, SpawnTool, SubAgentDefaults};
use herald_core::config::HeraldConfig;
use herald_providers::{create_provider, Provider};
use herald_sessions::SessionManager;
use herald_tools::filesystem::{EditTool, PathAllowlist, ReadTool, WriteTool};
use herald_tools::messaging::{MessageTool, ReactTool, TimestampLookup};
use herald_tools::registry::ToolRegistry;
use herald_tools::shell::ExecTool;

mod app;
mod attach;
mod auth;
mod context;
mod dispatcher;
mod http;
mod monitor;
mod rate_limit;

#[derive(Parser)]
#[command(name = "herald-gateway", about = "Herald conversational agent daemon")]
struct Args {
    /// Path to herald.toml (default: HERALD_CONFIG or ~/.herald/herald.toml)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=info,herald_gateway=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = match HeraldConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // Providers, one per configured model.
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    for (name, model_cfg) in &config.models {
        match create_provider(model_cfg, &model_cfg.api_key()) {
            Ok(provider) => {
                info!(model = name, provider = %model_cfg.provider, "provider ready");
                providers.insert(name.clone(), provider);
            }
            Err(e) => {
                eprintln!("Provider '{name}' failed to initialize: {e}");
                std::process::exit(1);
            }
        }
    }

    let ledger = CostLedger::new(config.cost_db_path());
    if let Err(e) = ledger.init() {
        warn!(error = %e, "cost ledger init failed, spend tracking degraded");
    }

    let sessions = Arc::new(Mutex::new(SessionManager::new(
        config.sessions_dir(),
        config.agent.name.clone(),
    )?));

    // Transport adapter. "none" is a valid HTTP-only deployment; other
    // types are wired by the out-of-tree channel adapters.
    let channel: Option<Arc<dyn herald_core::channel::Channel>> = match config.channel.r#type.as_str() {
        "none" => None,
        other => {
            warn!(channel = other, "no channel adapter linked in this build, replies via HTTP only");
            None
        }
    };

    // Tools.
    let allowlist = Arc::new(PathAllowlist::new(&config.tools.filesystem_allowed_paths));
    let inbound_timestamps: Arc<DashMap<String, i64>> = Arc::new(DashMap::new());
    let timestamps = inbound_timestamps.clone();
    let timestamp_lookup: TimestampLookup =
        Arc::new(move |sender: &str| timestamps.get(sender).map(|entry| *entry.value()));

    let registry = Arc::new(ToolRegistry::new(config.tools.truncation_limit));
    registry.register_many(vec![
        Arc::new(ReadTool::new(allowlist.clone())),
        Arc::new(WriteTool::new(allowlist.clone())),
        Arc::new(EditTool::new(allowlist.clone())),
        Arc::new(ExecTool::new(
            config.tools.shell_default_timeout_secs,
            config.tools.shell_max_timeout_secs,
            config.tools.secret_env_prefixes.clone(),
        )),
        Arc::new(MessageTool::new(
            channel.clone(),
            allowlist.clone(),
            config.channel.contacts.clone(),
        )),
        Arc::new(ReactTool::new(
            channel.clone(),
            Some(timestamp_lookup),
            config.channel.contacts.clone(),
        )),
    ]);
    registry.register(Arc::new(SpawnTool::new(
        Arc::downgrade(&registry),
        providers.clone(),
        config.models.clone(),
        Some(ledger.clone()),
        SubAgentDefaults {
            model: config.subagent.model.clone(),
            max_turns: config.subagent.max_turns,
            timeout: Duration::from_secs(config.subagent.timeout_secs),
        },
        config.subagent.deny.iter().cloned(),
        config.channel.contacts.clone(),
        config.tools.filesystem_allowed_paths.clone(),
    )));

    // Dispatcher — the single queue consumer.
    let (queue_tx, queue_rx) = mpsc::channel(256);
    let dispatcher = dispatcher::Dispatcher {
        config: config.clone(),
        providers,
        registry,
        sessions: sessions.clone(),
        ledger: ledger.clone(),
        channel,
        monitor: monitor::MonitorWriter::new(config.monitor_path()),
        inbound_timestamps,
        http_client: reqwest::Client::new(),
    };
    tokio::spawn(dispatcher.run(queue_rx));

    if !config.http.enabled {
        info!("HTTP API disabled; dispatcher idle until a channel adapter feeds the queue");
        // Keep the process alive for transport-only deployments.
        futures_pending().await;
        return Ok(());
    }

    let bind = format!("{}:{}", config.http.host, config.http.port);
    let state = Arc::new(app::AppState::new(config, queue_tx, sessions, ledger));
    let router = http::build_router(state);

    let addr: SocketAddr = bind.parse()?;
    info!("HTTP API listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn futures_pending() {
    std::future::pending::<()>().await
}
