use clap::Parser;
use log::{error, info};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use warden::listener::{run_listener, LogRouter};
use warden::rcon::TcpConnector;
use warden::rpc::{serve, Warden};
use warden::settings::Args;

/// Main-method of the application.
/// Parses configuration, then spawns the UDP log listener and the RPC server.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let rpc_addr = args.rpc_addr.clone();
    let logs_bind = args.logs_bind.clone();
    let router = Arc::new(LogRouter::new(args.print_log_messages));
    let settings = Arc::new(args.into_settings());

    info!("Starting warden...");
    info!("Configs: {}", settings.configs_dir.display());
    info!("Logs are sent to {}", settings.log_address);

    let socket = UdpSocket::bind(&logs_bind).await?;
    info!("Log listener bound to {}", socket.local_addr()?);
    let listener_handle = tokio::spawn(run_listener(socket, Arc::clone(&router)));

    let warden = Arc::new(Warden::new(
        settings,
        Arc::new(TcpConnector::default()),
        router,
        None,
    ));
    let rpc = TcpListener::bind(&rpc_addr).await?;
    let rpc_handle = tokio::spawn(serve(rpc, warden));

    // Handle shutdown gracefully
    tokio::select! {
        result = listener_handle => {
            if let Err(e) = result {
                error!("Log listener task panicked: {}", e);
            }
        }
        result = rpc_handle => {
            match result {
                Ok(Err(e)) => error!("RPC server failed: {}", e),
                Err(e) => error!("RPC task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}
