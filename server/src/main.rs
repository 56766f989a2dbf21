//! Reference line-protocol server binary.

mod config;
mod logging;
mod service;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use reactor::{EventLoop, TcpServer};

use crate::config::Config;
use crate::service::LineService;

#[derive(Parser)]
#[command(name = "lineserver")]
#[command(about = "Multi-loop TCP server speaking the [id:]payload line protocol")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Override the listen address from the config
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the worker thread count from the config
    #[arg(long)]
    threads: Option<usize>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let event_loop = EventLoop::new();
    let server = TcpServer::new(&event_loop, config.listen, false)?;
    server.set_thread_count(config.threads);

    let tcp_no_delay = config.tcp_no_delay;
    server.set_connection_callback(Arc::new(move |conn| {
        info!(
            conn = %conn.name(),
            peer = %conn.peer_addr(),
            up = conn.connected(),
            "connection"
        );
        if conn.connected() && tcp_no_delay {
            conn.set_tcp_no_delay(true);
        }
    }));

    let service = LineService::new(config.cell_count);
    service.install(&server);

    info!(
        listen = %server.listen_addr(),
        threads = config.threads,
        cell_count = config.cell_count,
        "line server starting"
    );
    server.start();
    event_loop.run();
    Ok(())
}

fn print_default_config() {
    let config = r#"# Line server configuration

# Address to listen on
listen = "127.0.0.1:7188"

# Worker event loops (0 = serve everything on the accept loop)
threads = 4

# Fixed payload length a request must carry
cell_count = 81

# Disable Nagle's algorithm on accepted connections
tcp_no_delay = true

[logging]
# Level filter when RUST_LOG is not set
level = "info"

# Output format: "pretty", "compact", or "json"
format = "pretty"

# Include timestamps in output
timestamps = true
"#;
    print!("{config}");
}
