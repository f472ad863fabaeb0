use std::net::IpAddr;
use std::process::ExitCode;

use clap::Parser;
use roomlink::config::ServerConfig;
use roomlink::{logger, server};

/// Session directory and signal relay for ad-hoc WebRTC rooms.
#[derive(Debug, Parser)]
#[command(name = "roomlink-server", version, about)]
struct Args {
    /// TCP port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Address to bind
    #[arg(long, env = "ROOMLINK_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Outbound frames buffered per connection before messages are dropped
    #[arg(long, env = "ROOMLINK_MAX_SEND_QUEUE", default_value_t = 256)]
    max_send_queue: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        bind: args.bind,
        port: args.port,
        max_send_queue: args.max_send_queue,
        ..ServerConfig::default()
    };

    let handle = match server::start(config).await {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, port = args.port, "failed to start directory server");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(port = handle.port, "roomlink server ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl+c");
        return ExitCode::FAILURE;
    }

    tracing::info!("shutting down");
    handle.shutdown();
    ExitCode::SUCCESS
}
