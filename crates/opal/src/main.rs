mod config;
mod session;
mod store;

use bytes::Bytes;
use config::Config;
use log::{error, info};
use rand::Rng;
use session::UdpSession;
use std::sync::Arc;
use store::MemoryStore;
use tokio::sync::mpsc;
use utpal::{ContentCoordinator, ContentResponse, NetworkId, UtpTransport};

#[derive(thiserror::Error, Debug)]
enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Utp(#[from] utpal::UtpError),
    #[error("logger error: {0}")]
    Log(#[from] log::SetLoggerError),
    #[error("demo transfer corrupted the payload")]
    DemoMismatch,
}

type Result<T> = std::result::Result<T, AppError>;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_or_create()?;
    opal_log::init(config.log_level())?;
    info!("starting node '{}'", config.node.name);

    if let Some(demo) = &config.demo {
        run_demo(demo.payload_size).await?;
    }
    run_node(&config).await
}

/// Binds the configured UDP endpoint and serves the transport until shutdown.
async fn run_node(config: &Config) -> Result<()> {
    let session = UdpSession::bind(config.bind_addr()?).await?;
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (transport, handle) = UtpTransport::new(out_tx);
    tokio::spawn(transport.run());

    info!("node '{}' listening for transfers", config.node.name);
    session.run(handle, out_rx).await?;
    info!("transport stopped");
    Ok(())
}

/// Loopback self-check: two in-process nodes on localhost UDP move one
/// random payload through the full fetch path.
async fn run_demo(payload_size: usize) -> Result<()> {
    let server_session = Arc::new(UdpSession::bind("127.0.0.1:0".parse().unwrap()).await?);
    let client_session = Arc::new(UdpSession::bind("127.0.0.1:0".parse().unwrap()).await?);
    let server_addr = server_session.local_addr()?;
    let client_addr = client_session.local_addr()?;

    let (server_out_tx, server_out_rx) = mpsc::unbounded_channel();
    let (server_transport, server_handle) = UtpTransport::new(server_out_tx);
    tokio::spawn(server_transport.run());
    let server_pump = server_session.clone();
    let pump_handle = server_handle.clone();
    tokio::spawn(async move { server_pump.run(pump_handle, server_out_rx).await });

    let (client_out_tx, client_out_rx) = mpsc::unbounded_channel();
    let (client_transport, client_handle) = UtpTransport::new(client_out_tx);
    tokio::spawn(client_transport.run());
    let client_pump = client_session.clone();
    let pump_handle = client_handle.clone();
    tokio::spawn(async move { client_pump.run(pump_handle, client_out_rx).await });

    let server = ContentCoordinator::new(server_handle, Arc::new(MemoryStore::new()), NetworkId(0));
    let client_store = Arc::new(MemoryStore::new());
    let client = ContentCoordinator::new(client_handle, client_store.clone(), NetworkId(0));

    let mut rng = rand::rng();
    let content: Bytes = (0..payload_size).map(|_| rng.random::<u8>()).collect();
    let content_key: [u8; 32] = rng.random();

    info!(
        "demo: offering {} bytes under key {}",
        content.len(),
        hex::encode(content_key)
    );

    // Server side of a find-content handoff; client pulls over the
    // advertised connection id.
    let (conn_id, transfer) = server.handoff(client_addr, content.clone()).await?;
    let fetch = client.fetch(server_addr, &content_key, ContentResponse::ConnectionId(conn_id));
    let (fetched, sent) = tokio::join!(fetch, transfer.wait());
    sent?;
    let fetched = fetched?;

    if fetched != content {
        error!("demo: payload mismatch ({} bytes fetched)", fetched.len());
        return Err(AppError::DemoMismatch);
    }
    info!(
        "demo: transfer complete, {} bytes verified, {} item(s) stored",
        fetched.len(),
        client_store.len()
    );
    Ok(())
}
