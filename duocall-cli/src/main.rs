//! Duocall CLI Application

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use duocall_core::prelude::*;
use duocall_core::sim::{SimMediaDevices, SimNetwork};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a complete call between two in-process users
    Demo {
        /// Calling user
        #[arg(long, default_value = "alice", env = "DUOCALL_CALLER")]
        caller: String,

        /// Called user
        #[arg(long, default_value = "bob", env = "DUOCALL_CALLEE")]
        callee: String,

        /// Call kind
        #[arg(long, value_enum, default_value = "video")]
        kind: CliKind,

        /// Callee declines instead of answering
        #[arg(long)]
        reject: bool,

        /// Caller refuses camera access
        #[arg(long)]
        deny_camera: bool,

        /// Seconds to stay connected before the caller hangs up
        #[arg(long, default_value = "3")]
        hangup_after: u64,

        /// JSON call manager configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the call id two users share
    CallId {
        /// First user
        a: String,

        /// Second user
        b: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliKind {
    Video,
    Voice,
}

impl From<CliKind> for MediaKind {
    fn from(kind: CliKind) -> Self {
        match kind {
            CliKind::Video => MediaKind::Video,
            CliKind::Voice => MediaKind::Voice,
        }
    }
}

struct DemoOptions {
    caller: String,
    callee: String,
    kind: MediaKind,
    reject: bool,
    deny_camera: bool,
    hangup_after: Duration,
    config: CallManagerConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("duocall=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            caller,
            callee,
            kind,
            reject,
            deny_camera,
            hangup_after,
            config,
        } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => CallManagerConfig::default(),
            };
            handle_demo(DemoOptions {
                caller,
                callee,
                kind: kind.into(),
                reject,
                deny_camera,
                hangup_after: Duration::from_secs(hangup_after),
                config,
            })
            .await?;
        }
        Commands::CallId { a, b } => {
            println!("{}", call_id_for(&a, &b)?);
        }
    }

    Ok(())
}

fn load_config(path: &PathBuf) -> Result<CallManagerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: CallManagerConfig =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn call_id_for(a: &str, b: &str) -> Result<CallId> {
    let a = UserId::new(a)?;
    let b = UserId::new(b)?;
    Ok(CallId::for_pair(&a, &b))
}

fn build_manager(
    name: &str,
    store: &MemorySignalingStore,
    network: &SimNetwork,
    devices: SimMediaDevices,
    config: CallManagerConfig,
) -> Result<CallManager<MemorySignalingStore>> {
    let manager = CallManager::builder(UserId::new(name)?, Arc::new(store.clone()))
        .with_media_devices(Arc::new(devices))
        .with_peer_factory(Arc::new(network.factory(name)))
        .with_config(config)
        .build()?;
    Ok(manager)
}

fn print_events(label: String, mut events: broadcast::Receiver<CallEvent>) {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("[{label}] {json}"),
                Err(e) => tracing::warn!(error = %e, "Cannot render event"),
            }
        }
    });
}

async fn wait_for_phase(
    manager: &CallManager<MemorySignalingStore>,
    done: impl Fn(CallPhase) -> bool,
) -> Result<CallSnapshot> {
    let mut state = manager.subscribe_state();
    let snapshot = tokio::time::timeout(
        Duration::from_secs(10),
        state.wait_for(|s| done(s.phase)),
    )
    .await
    .context("timed out waiting for call state")??
    .clone();
    Ok(snapshot)
}

async fn handle_demo(options: DemoOptions) -> Result<()> {
    let store = MemorySignalingStore::new();
    let network = SimNetwork::new();

    let caller_devices = SimMediaDevices::new();
    caller_devices.deny_camera(options.deny_camera);

    let caller = build_manager(
        &options.caller,
        &store,
        &network,
        caller_devices,
        options.config.clone(),
    )?;
    let callee = build_manager(
        &options.callee,
        &store,
        &network,
        SimMediaDevices::new(),
        options.config,
    )?;

    print_events(options.caller.clone(), caller.subscribe_events());
    print_events(options.callee.clone(), callee.subscribe_events());

    caller.start().await?;
    callee.start().await?;

    let call_id = caller
        .start_call(callee.local_user(), options.kind)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e.user_message()))?;
    println!("Calling {} ({call_id})", options.callee);

    wait_for_phase(&callee, |p| p == CallPhase::Offered).await?;
    if options.reject {
        callee.reject_incoming().await?;
    } else {
        callee.accept_incoming().await?;
        let connected =
            wait_for_phase(&caller, |p| matches!(p, CallPhase::Connected | CallPhase::Ended))
                .await?;
        if connected.phase == CallPhase::Connected {
            println!("Connected, hanging up in {}s", options.hangup_after.as_secs());
            tokio::time::sleep(options.hangup_after).await;
            caller.end_call().await?;
        }
    }

    for (name, manager) in [(&options.caller, &caller), (&options.callee, &callee)] {
        let ended = wait_for_phase(manager, |p| p == CallPhase::Ended).await?;
        let reason = ended
            .end_reason
            .map(|r| r.user_message())
            .unwrap_or("Call ended.");
        println!(
            "{name}: {reason} after {}s\n{}",
            ended.duration_secs,
            serde_json::to_string_pretty(&ended)?
        );
    }

    caller.shutdown().await;
    callee.shutdown().await;
    Ok(())
}
