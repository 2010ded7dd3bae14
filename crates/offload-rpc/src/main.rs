//! Offload server - executes offloaded functions for remote callers.
//!
//! Serves the built-in kernel table either over TCP (one session per
//! connection) or through a shared memory segment (a single session).

use anyhow::Result;
use clap::Parser;
use offload_core::{
    exit_on_fatal, kernels, CommType, ServerSession, ShmemConfig, ShmemServerTransport,
    StreamConfig, StreamServer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "offload-server")]
#[command(about = "Offload RPC server running the built-in kernels")]
struct Args {
    /// Communication mechanism: socket or sharedmem
    #[arg(long, default_value = "socket", value_parser = parse_comm)]
    comm: CommType,

    /// Host to bind to
    #[arg(long, default_value = StreamConfig::DEFAULT_HOST)]
    host: String,

    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = StreamConfig::DEFAULT_PORT)]
    port: u16,

    /// Base name of the shared memory objects
    #[arg(long, default_value = ShmemConfig::REGION_NAME)]
    shmem_name: String,

    /// Size of the shared memory region in bytes
    #[arg(long, default_value_t = ShmemConfig::DEFAULT_SIZE)]
    shmem_size: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_comm(s: &str) -> std::result::Result<CommType, String> {
    CommType::from_str(s).ok_or_else(|| format!("unknown communication type '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting offload server ({})", args.comm);

    let loader = Arc::new(kernels::builtin_table()?);

    match args.comm {
        CommType::Socket => {
            let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
            let server = match StreamServer::start(addr, loader).await {
                Ok(server) => server,
                Err(e) => exit_on_fatal(&e),
            };

            // Print port for launchers to read (intentional stdout)
            println!("OFFLOAD_PORT={}", server.addr().port());

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received, exiting");
        }
        CommType::SharedMem => {
            let config = ShmemConfig::with_base(&args.shmem_name, args.shmem_size);
            let transport = match ShmemServerTransport::create(config.clone()) {
                Ok(transport) => transport,
                Err(e) => exit_on_fatal(&e),
            };

            println!("OFFLOAD_SHMEM={}", config.region_name);

            tokio::select! {
                result = ServerSession::new(transport, loader).run() => {
                    match result {
                        Ok(summary) => info!("Session finished after {} calls", summary.calls),
                        Err(e) => exit_on_fatal(&e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    // The session is dropped by now, so the shared objects are
                    // unlinked. A semaphore wait may still hold a blocking
                    // thread, which would stall runtime shutdown.
                    info!("Shutdown signal received, exiting");
                    std::process::exit(0);
                }
            }
        }
    }

    Ok(())
}
