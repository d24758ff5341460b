//! provd — the provisioning daemon.
//!
//! One binary, one worker per process:
//! - `dispatcher` fans events from the incoming queue out to subscribers
//! - `prefill` backfills new subscriptions from the UDM REST API
//!
//! # Usage
//!
//! ```text
//! provd --config /etc/provd.toml dispatcher
//! provd --config /etc/provd.toml prefill
//! provd --config /etc/provd.toml check-config
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_nats::jetstream;
use clap::{Parser, Subcommand};
use prov_core::ProvConfig;
use prov_core::config::LogFormat;
use prov_dispatcher::Dispatcher;
use prov_prefill::{PrefillService, UdmRestSource};
use prov_queue::{AckWaitSupervisor, NatsBroker, QueueAdapter};
use prov_registry::SubscriptionRegistry;
use prov_state::{Bucket, KvAdapter, NatsKv};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,provd=debug,prov=debug";

#[derive(Parser)]
#[command(name = "provd", about = "Provisioning daemon")]
struct Cli {
    /// Configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Route incoming events to subscriber queues.
    Dispatcher,

    /// Serve prefill requests for new subscriptions.
    Prefill,

    /// Print the effective configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ProvConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProvConfig::default(),
    };
    config.apply_env();

    if let Command::CheckConfig = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    init_tracing(config.logging.format);

    match cli.command {
        Command::Dispatcher => run_dispatcher(config).await,
        Command::Prefill => run_prefill(config).await,
        Command::CheckConfig => Ok(()),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

// ── Wiring ────────────────────────────────────────────────────

struct Bus {
    queues: QueueAdapter,
    kv: KvAdapter,
    supervisor: AckWaitSupervisor,
}

async fn connect(config: &ProvConfig) -> anyhow::Result<Bus> {
    let nats = &config.nats;
    let mut options = async_nats::ConnectOptions::new().max_reconnects(nats.max_reconnect_attempts);
    if let (Some(user), Some(password)) = (&nats.user, &nats.password) {
        options = options.user_and_password(user.clone(), password.clone());
    }
    let client = options
        .connect(nats.server.as_str())
        .await
        .with_context(|| format!("connecting to {}", nats.server))?;
    info!(server = %nats.server, "connected to NATS");

    let js = jetstream::new(client);
    let kv = KvAdapter::new(Arc::new(NatsKv::new(js.clone())));
    kv.init(&Bucket::ALL).await?;
    let queues = QueueAdapter::new(
        Arc::new(NatsBroker::new(js)),
        nats.replicas,
        config.ack.ack_wait(),
    );
    let supervisor = AckWaitSupervisor::new(config.ack.ack_wait(), config.ack.ack_threshold());
    Ok(Bus {
        queues,
        kv,
        supervisor,
    })
}

/// Flip the shutdown channel on Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl-C, shutting down"),
        }
        let _ = tx.send(true);
    });
    rx
}

// ── Workers ───────────────────────────────────────────────────

async fn run_dispatcher(config: ProvConfig) -> anyhow::Result<()> {
    info!(
        migrate_stream = config.dispatcher.migrate_stream,
        redundant_replicas = config.dispatcher.redundant_replicas,
        "dispatcher starting"
    );
    let bus = connect(&config).await?;
    let dispatcher = Dispatcher::new(bus.queues, bus.kv, bus.supervisor, &config.dispatcher);
    dispatcher.run(shutdown_on_ctrl_c()).await?;
    info!("dispatcher stopped");
    Ok(())
}

async fn run_prefill(config: ProvConfig) -> anyhow::Result<()> {
    info!(udm = %config.udm.url, "prefill service starting");
    let bus = connect(&config).await?;
    let registry = SubscriptionRegistry::new(bus.kv, bus.queues.clone());
    let source = UdmRestSource::new(&config.udm)?;
    let service = PrefillService::new(
        bus.queues,
        Arc::new(source),
        Arc::new(registry),
        bus.supervisor,
        &config.prefill,
    );
    service.run(shutdown_on_ctrl_c()).await?;
    info!("prefill service stopped");
    Ok(())
}
