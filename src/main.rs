use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use ridgenet::{
    BootstrapPeer, DhtAdapter, DhtTable, MemoryNetwork, MemoryNode, NetError, NetworkNode,
    NodeConfig, OpContext, OverlayAdapter, OverlaySubscriber, RldpConfig, RldpManager, Topic,
    UdpNode, load_identity,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Single-process network, useful for smoke tests.
    Memory,
    Udp,
}

#[derive(Parser, Debug)]
#[command(name = "ridgenet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Keypair file; generated on first run. Ephemeral if omitted.
    #[arg(short, long, value_name = "PATH")]
    identity: Option<PathBuf>,

    #[arg(short, long = "listen", value_name = "ADDR", default_value = "0.0.0.0:0")]
    listen: Vec<String>,

    #[arg(short = 'B', long = "bootstrap", value_name = "HOST:PORT/PEER_ID")]
    bootstrap: Vec<BootstrapPeer>,

    /// Per-request deadline in seconds.
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    #[arg(long, value_enum, default_value = "udp")]
    backend: Backend,

    /// Topics to subscribe to and log.
    #[arg(short = 's', long = "subscribe", value_name = "TOPIC")]
    subscribe: Vec<String>,

    #[arg(short, long)]
    debug: bool,

    #[arg(long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = load_identity(args.identity.as_deref()).context("failed to load identity")?;
    let config = NodeConfig {
        listen_addrs: args.listen.clone(),
        bootstrap: args.bootstrap.clone(),
        identity_path: args.identity.clone(),
        request_timeout: Duration::from_secs(args.timeout.max(1)),
        ..NodeConfig::default()
    };
    config.validate().context("invalid configuration")?;

    let node: Arc<dyn NetworkNode> = match args.backend {
        Backend::Udp => Arc::new(
            UdpNode::bind(&keypair, config)
                .await
                .context("failed to bind udp socket")?,
        ),
        Backend::Memory => Arc::new(MemoryNode::new(&MemoryNetwork::new(), &keypair, &config)),
    };

    let ctx = OpContext::background();
    node.start(&ctx).await.context("failed to start node")?;
    info!(peer = %node.peer_id(), addr = %node.addr().address, "node started");

    let dht = DhtAdapter::new(node.clone());
    dht.start(&ctx).await.context("failed to start dht")?;

    let overlay = OverlayAdapter::new(node.clone());
    for name in &args.subscribe {
        let topic = Topic::new(name.clone()).context("invalid topic")?;
        let mut sub = overlay
            .subscribe(&topic)
            .await
            .with_context(|| format!("failed to subscribe to {name}"))?;
        let spawned = node.spawn(Box::pin(async move {
            while let Some(msg) = sub.recv().await {
                info!(
                    topic = %msg.topic,
                    source = %msg.source.fingerprint(),
                    bytes = msg.data.len(),
                    "topic message"
                );
            }
        }));
        spawned.context("failed to spawn subscription logger")?;
    }

    let rldp = RldpManager::new(node.clone(), RldpConfig::default())
        .context("invalid stream configuration")?;
    rldp.start(&ctx).await.context("failed to start rldp")?;
    let acceptor = rldp.clone();
    let tasks = node.clone();
    node.spawn(Box::pin(async move {
        loop {
            let stream = match acceptor.accept(&OpContext::background()).await {
                Ok(stream) => stream,
                Err(NetError::Closed) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let stream_id = stream.id();
            let reader = tasks.spawn(Box::pin(async move {
                let ctx = OpContext::background();
                match stream.read_to_end(&ctx).await {
                    Ok(data) => info!(
                        peer = %stream.peer().peer_id.fingerprint(),
                        stream_id = stream.id(),
                        bytes = data.len(),
                        "stream finished"
                    ),
                    Err(e) => debug!(stream_id = stream.id(), error = %e, "stream ended"),
                }
            }));
            if let Err(e) = reader {
                debug!(stream_id, error = %e, "stream reader not started");
                break;
            }
        }
    }))
    .context("failed to spawn stream acceptor")?;

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.telemetry().await;
                let streams = rldp.stats().await;
                info!(
                    routing_peers = snapshot.routing_peers,
                    provider_keys = snapshot.provider_keys,
                    stored_values = snapshot.stored_values,
                    subscriptions = snapshot.subscriptions,
                    overlay_peers = snapshot.overlay_peers,
                    tasks = snapshot.background_tasks,
                    streams = streams.streams,
                    corrupt_frames = streams.corrupt_frames,
                    "telemetry snapshot"
                );
            }
        }
    }

    let ctx = OpContext::with_timeout(Duration::from_secs(5));
    if let Err(e) = rldp.close(&ctx).await {
        warn!(error = %e, "rldp close failed");
    }
    if let Err(e) = overlay.close().await {
        warn!(error = %e, "overlay close failed");
    }
    if let Err(e) = dht.close(&ctx).await {
        warn!(error = %e, "dht close failed");
    }
    node.close(&ctx).await.context("failed to close node")?;
    Ok(())
}
