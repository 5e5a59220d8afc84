//! `smp-server` — run an SMP broker from a JSON configuration file.
//!
//! Exit codes: 0 on clean shutdown, 1 on configuration or fatal runtime
//! errors, 2 on a panic.

use clap::Parser;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use smq::logging;
use smq::server::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "smp-server", version, about = "SMP message broker")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Increase diagnostic verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config = match ServerConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(1);
        }
    };
    let _log_guard = logging::init(&config.log_level, config.log_file.as_deref(), args.verbose);
    info!(version = smq::VERSION, "starting smp-server");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("runtime setup failed: {e}");
            return ExitCode::from(1);
        }
    };

    match std::panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(serve(config)))) {
        Ok(Ok(())) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!("fatal: {e:#}");
            ExitCode::from(1)
        }
        Err(_) => ExitCode::from(2),
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let server = Server::bind(&config).await?;
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}
