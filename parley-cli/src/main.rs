//! Parley CLI demo
//!
//! Drives two in-process endpoints through a scripted call over the
//! in-memory signaling hub and the loopback media network, printing every
//! state transition. Useful for eyeballing the call lifecycle without a
//! real media engine behind the link trait.

use anyhow::Result;
use clap::{Parser, Subcommand};
use parley_core::prelude::*;
use parley_core::CallManager;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Identity to run the caller endpoint under
    #[arg(short, long, env = "PARLEY_IDENTITY", default_value = "alice")]
    identity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted call between two in-process endpoints
    Demo {
        /// Peer identity for the callee endpoint
        #[arg(long, default_value = "bob")]
        peer: String,

        /// Place a video call instead of voice
        #[arg(long)]
        video: bool,

        /// Decline the call instead of accepting it
        #[arg(long)]
        reject: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "2")]
        talk_secs: u64,
    },

    /// Print a sample of the signaling wire format
    Wire,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Demo {
            peer,
            video,
            reject,
            talk_secs,
        } => run_demo(&cli.identity, &peer, video, reject, talk_secs).await,
        Commands::Wire => print_wire_sample(&cli.identity),
    }
}

async fn run_demo(caller: &str, callee: &str, video: bool, reject: bool, talk_secs: u64) -> Result<()> {
    let kind = if video { MediaKind::Video } else { MediaKind::Voice };
    println!("📞 {caller} calling {callee} ({kind:?})");

    let hub: Arc<InMemorySignaling<PeerIdentityString>> = InMemorySignaling::new();
    let links = LoopbackNetwork::new();

    let a = spawn_endpoint(caller, &hub, &links).await?;
    let b = spawn_endpoint(callee, &hub, &links).await?;

    watch_states(caller, a.watch_state());
    watch_states(callee, b.watch_state());

    a.start_call(
        PeerInfo::new(PeerIdentityString::new(callee), callee),
        kind,
    )
    .await?;

    // Give the offer time to ring the callee.
    wait_for(&b, CallStatus::Ringing).await;

    if reject {
        b.reject_call().await?;
    } else {
        b.accept_call().await?;
        wait_for(&a, CallStatus::Connected).await;
        println!(
            "🔊 connected, talking for {talk_secs}s (remote track: {:?})",
            a.remote_track().map(|t| t.id)
        );
        tokio::time::sleep(Duration::from_secs(talk_secs)).await;
        println!(
            "⏱  duration: {:?}s",
            a.call_duration_seconds().unwrap_or(0)
        );
        a.end_call().await?;
    }

    wait_for(&a, CallStatus::Idle).await;
    wait_for(&b, CallStatus::Idle).await;
    println!("✅ both endpoints back to idle");

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

async fn spawn_endpoint(
    name: &str,
    hub: &Arc<InMemorySignaling<PeerIdentityString>>,
    links: &LoopbackNetwork,
) -> Result<CallManager<PeerIdentityString>> {
    let manager = CallManager::builder(
        PeerIdentityString::new(name),
        hub.clone(),
        Arc::new(SyntheticMediaSource::granting()),
        Arc::new(links.clone()),
    )
    .spawn()
    .await?;
    tracing::info!(endpoint = name, "Endpoint ready");
    Ok(manager)
}

fn watch_states(
    name: &str,
    mut rx: tokio::sync::watch::Receiver<CallState<PeerIdentityString>>,
) {
    let name = name.to_string();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = rx.borrow().clone();
            println!(
                "   [{name}] {:?} (incoming: {}, peer: {:?})",
                state.status,
                state.is_incoming,
                state.peer.as_ref().map(|p| p.display_name.clone()),
            );
        }
    });
}

async fn wait_for(manager: &CallManager<PeerIdentityString>, status: CallStatus) {
    let mut rx = manager.watch_state();
    loop {
        if rx.borrow().status == status {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn print_wire_sample(identity: &str) -> Result<()> {
    let offer: SignalingMessage<PeerIdentityString> = SignalingMessage::Offer {
        call_id: CallId::new(),
        from: PeerIdentityString::new(identity),
        to: PeerIdentityString::new("bob"),
        media_kind: MediaKind::Video,
        description: parley_core::SessionDescription::offer("v=0 ..."),
    };
    println!("{}", serde_json::to_string_pretty(&offer)?);
    Ok(())
}
