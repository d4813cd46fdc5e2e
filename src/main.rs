use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use cdc_scheduler::api::{run_api, ApiState, OwnerSlot};
use cdc_scheduler::capture::CaptureNode;
use cdc_scheduler::config::{AgentConfig, CaptureConfig, SchedulerConfig};
use cdc_scheduler::election::LocalElection;
use cdc_scheduler::error::SchedulerError;
use cdc_scheduler::model::{
    compose_ts, extract_physical, ts_from_datetime, CaptureId, KeySpan, KeySpanId,
};
use cdc_scheduler::processor::InMemoryExecutor;
use cdc_scheduler::protocol::InboundMessage;
use cdc_scheduler::shutdown::install_shutdown_handler;
use cdc_scheduler::transport::LocalHub;

#[derive(Parser, Debug)]
#[command(name = "cdc-scheduler")]
#[command(version)]
#[command(about = "Keyspan scheduling for a change-data-capture owner and its processors")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an owner and several captures in one process
    Simulate(SimulateArgs),

    /// Decode a protocol payload and print it as JSON
    Decode {
        /// Topic the payload was received on, e.g. "dispatch/cf-1"
        #[arg(long)]
        topic: String,

        /// Payload bytes, base64 encoded
        #[arg(long)]
        payload: String,
    },
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Changefeed to schedule
    #[arg(long, default_value = "cf-1")]
    changefeed: String,

    /// Number of captures
    #[arg(long, default_value = "3")]
    captures: usize,

    /// Number of keyspans to replicate
    #[arg(long, default_value = "8")]
    keyspans: u64,

    /// Port for the HTTP API (optional)
    #[arg(long)]
    api_port: Option<u16>,

    /// Owner tick interval in milliseconds
    #[arg(long, default_value = "100")]
    tick_interval_ms: u64,

    /// How long the owner waits for a sync report before treating a capture as empty
    #[arg(long, default_value = "10000")]
    reconcile_timeout_ms: u64,

    /// Hand ownership to the second capture after this many seconds
    #[arg(long)]
    failover_after_secs: Option<u64>,

    /// Stop after this many seconds instead of waiting for a signal
    #[arg(long)]
    duration_secs: Option<u64>,
}

/// Split the key space into `count` contiguous keyspans.
fn build_keyspans(count: u64) -> BTreeMap<KeySpanId, KeySpan> {
    (0..count)
        .map(|i| {
            let start = format!("t_{i:04}").into_bytes();
            let end = format!("t_{:04}", i + 1).into_bytes();
            (i + 1, KeySpan::new(start, end))
        })
        .collect()
}

fn spawn_owner(
    node: Arc<CaptureNode>,
    election: LocalElection,
    membership: watch::Receiver<BTreeSet<CaptureId>>,
    keyspans: watch::Receiver<BTreeMap<KeySpanId, KeySpan>>,
) {
    tokio::spawn(async move {
        match node.run_owner(&election, membership, keyspans).await {
            Ok(()) => tracing::info!(capture = %node.id(), "Owner stopped"),
            Err(SchedulerError::OwnershipLost(revision)) => {
                tracing::info!(capture = %node.id(), revision, "Owner deposed");
            }
            Err(e) => tracing::error!(capture = %node.id(), error = %e, "Owner failed"),
        }
    });
}

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.captures == 0 {
        return Err("--captures must be at least 1".into());
    }
    let scheduler = SchedulerConfig::default()
        .with_tick_interval_ms(args.tick_interval_ms)
        .with_reconcile_timeout_ms(args.reconcile_timeout_ms);
    scheduler.validate()?;

    let cancel = install_shutdown_handler();
    let hub = LocalHub::new();
    let election = LocalElection::new();
    let owner_slot = OwnerSlot::new();

    let mut nodes = Vec::with_capacity(args.captures);
    let mut executors = Vec::with_capacity(args.captures);
    for _ in 0..args.captures {
        let capture_id = format!("capture-{}", uuid::Uuid::new_v4());
        let config = CaptureConfig::new(capture_id, args.changefeed.clone())
            .with_scheduler(scheduler.clone())
            .with_agent(AgentConfig::default());
        let executor = Arc::new(InMemoryExecutor::new());
        let node = CaptureNode::start_with_owner_slot(
            config,
            &hub,
            executor.clone(),
            owner_slot.clone(),
            cancel.child_token(),
        )?;
        nodes.push(node);
        executors.push(executor);
    }

    let members: BTreeSet<CaptureId> = nodes.iter().map(|n| n.id().to_string()).collect();
    let (_membership_tx, membership) = watch::channel(members);
    let (_keyspans_tx, keyspans) = watch::channel(build_keyspans(args.keyspans));

    tracing::info!(
        changefeed = %args.changefeed,
        captures = args.captures,
        keyspans = args.keyspans,
        "Starting simulation"
    );

    if let Some(port) = args.api_port {
        let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
        let state = ApiState {
            owner: owner_slot.clone(),
        };
        let api_cancel = cancel.child_token();
        tokio::spawn(async move {
            run_api(addr, state, api_cancel).await;
        });
    }

    spawn_owner(
        nodes[0].clone(),
        election.clone(),
        membership.clone(),
        keyspans.clone(),
    );

    // Processors advance their progress with wall-clock TSOs.
    let tso_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = tso_cancel.cancelled() => break,
                _ = interval.tick() => {
                    let resolved_ts = ts_from_datetime(chrono::Utc::now());
                    let checkpoint_ts = compose_ts(extract_physical(resolved_ts).saturating_sub(1_000), 0);
                    for executor in &executors {
                        executor.advance(checkpoint_ts, resolved_ts);
                    }
                }
            }
        }
    });

    if let Some(secs) = args.failover_after_secs {
        if let Some(successor) = nodes.get(1).cloned() {
            let election = election.clone();
            let membership = membership.clone();
            let keyspans = keyspans.clone();
            let failover_cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = failover_cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        tracing::info!(capture = %successor.id(), "Handing ownership over");
                        spawn_owner(successor, election, membership, keyspans);
                    }
                }
            });
        } else {
            tracing::warn!("Failover needs at least two captures, ignoring --failover-after-secs");
        }
    }

    let mut report = tokio::time::interval(Duration::from_secs(2));
    let deadline = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut deadline => {
                cancel.cancel();
                break;
            }
            _ = report.tick() => log_progress(&owner_slot).await,
        }
    }

    // Give owner and agents a moment to observe cancellation.
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!("Simulation stopped");
    Ok(())
}

async fn log_progress(owner_slot: &OwnerSlot) {
    let Some(owner) = owner_slot.get().await else {
        tracing::info!("No owner in office");
        return;
    };
    let snapshot = owner.dispatcher().snapshot().await;
    let running = snapshot
        .keyspans
        .iter()
        .filter(|r| r.status == cdc_scheduler::scheduler::KeySpanStatus::Running)
        .count();
    let checkpoint = owner.global_checkpoint();
    tracing::info!(
        owner = %owner.capture(),
        revision = owner.revision(),
        running,
        records = snapshot.keyspans.len(),
        checkpoint_ts = ?checkpoint.map(|w| w.checkpoint_ts()),
        "Scheduler progress"
    );
}

fn run_decode(topic: &str, payload: &str) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = STANDARD.decode(payload.trim())?;
    let (changefeed, msg) = InboundMessage::decode(topic, &bytes)?;
    let output = serde_json::json!({
        "changefeed": changefeed,
        "topic": topic,
        "decoded": msg,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Simulate(sim_args) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();
            run_simulation(sim_args).await?;
        }
        Commands::Decode { topic, payload } => {
            run_decode(&topic, &payload)?;
        }
    }

    Ok(())
}
