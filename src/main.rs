//! Demo node binary: brings up a `NetworkManager` over the websocket
//! transport with an in-memory cube store, for manual testing against the
//! scenarios in the design doc.

use clap::Parser;
use cubeswarm::net::config::NetConfig;
use cubeswarm::net::network_manager::NetworkManager;
use cubeswarm::net::store::InMemoryCubeStore;
use cubeswarm::net::transport::Server;
use cubeswarm::net::transport::websocket::WsServer;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cubeswarm-node", about = "Minimal cube-swarm network node")]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:3021
    #[arg(long, default_value = "127.0.0.1:3021")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let store = Arc::new(InMemoryCubeStore::new());
    let manager = NetworkManager::new(NetConfig::default(), store);
    info!(identity = %manager.local_identity, listen = %args.listen, "starting node");

    let mut server = WsServer::bind(&args.listen).await?;
    info!(local = %server.local_description(), "listening");

    loop {
        match server.accept().await {
            Ok(conn) => info!(peer = %conn.peer_description(), "accepted connection"),
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                break;
            }
        }
    }

    Ok(())
}
