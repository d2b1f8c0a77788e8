use clap::Parser;
use env_logger::Env;

use peerlink::config::TunnelConfig;
use peerlink::error::*;
use peerlink::{Builder, PeerId};
use peerlink_core::transport::memory::MemoryNetwork;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Local UDP port game clients send to.
    /// example: --listen 27015
    #[arg(short, long)]
    listen: u16,
    /// Loopback port of the local server the host side forwards to.
    /// example: --target 7777
    #[arg(short, long)]
    target: u16,
    /// JSON tunnel config applied to both sides before the ports above
    #[arg(short, long)]
    config: Option<String>,
}

/// Runs a host and a client peer in one process, joined by an in-memory
/// transport, so `127.0.0.1:listen` reaches `127.0.0.1:target` through the tunnel.
#[tokio::main]
pub async fn main() -> Result<()> {
    let Args {
        listen,
        target,
        config,
    } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let config = match config {
        Some(path) => TunnelConfig::load(path)?,
        None => TunnelConfig::empty(),
    };

    let (tx, mut quit) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc2::set_async_handler(async move {
        tx.send(()).await.expect("Signal error");
    })
    .await;

    let host_id = PeerId::from(1);
    let client_id = PeerId::from(2);
    let network = MemoryNetwork::new();
    let host_transport = network.endpoint(host_id);
    host_transport.set_host(true);
    let client_transport = network.endpoint(client_id);
    network.connect(host_id, client_id);

    let (host, host_events) = Builder::new(host_transport)
        .config(config.clone().set_bind_port(0).set_target_port(target))
        .build()?;
    let (client, client_events) = Builder::new(client_transport)
        .config(config.set_bind_port(listen))
        .build()?;
    host.start()?;
    client.start()?;
    host.sessions().add_peer(client_id);
    client.sessions().add_peer(host_id);
    log::info!("relay 127.0.0.1:{listen} -> 127.0.0.1:{target}");

    tokio::spawn(async move {
        while let Ok(event) = host_events.recv().await {
            log::info!("host event: {event:?}");
        }
    });
    tokio::spawn(async move {
        while let Ok(event) = client_events.recv().await {
            log::info!("client event: {event:?}");
        }
    });

    quit.recv().await.expect("quit error");
    client.stop().await;
    host.stop().await;
    log::info!("exit");
    Ok(())
}
