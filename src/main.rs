mod cache;
mod config;
mod forwarder;
mod local;
mod protocol;
mod server;
mod table;

use cache::RedisCache;
use config::Config;
use forwarder::Forwarder;
use server::Server;
use std::{error::Error, sync::Arc};
use table::RequestTable;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // install global collector configured based on RUST_LOG env var.
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    let listen_addr = config.listen_addr();

    info!(
        %listen_addr,
        production = config.production,
        upstreams = config.upstreams.len(),
        "Starting"
    );

    let socket = Arc::new(UdpSocket::bind(listen_addr).await?);
    let cache = Arc::new(RedisCache::connect(&config.redis_host, config.redis_port).await);
    let table = Arc::new(RequestTable::new());
    let forwarder = Arc::new(Forwarder::new(
        Arc::clone(&socket),
        Arc::clone(&table),
        Arc::clone(&cache),
        config.upstreams.clone(),
        config::ATTEMPT_TIMEOUT,
    ));

    let server = Server::new(socket, cache, Arc::clone(&table), forwarder);
    server.spawn_periodic_jobs();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    // Stop reading the moment a signal lands; pending upstream exchanges
    // are dropped without failure replies, clients retry at their layer.
    tokio::select! {
        result = server.run() => result?,
        _ = sigint.recv() => shutdown(&table),
        _ = sigterm.recv() => shutdown(&table),
    }

    Ok(())
}

fn shutdown(table: &RequestTable) {
    let (pending, _) = table.stats();
    info!(pending, "Shutdown signal received, dropping pending requests");
}
