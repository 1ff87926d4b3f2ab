//! ftags server - main entry point

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ftags::config::Config;
use ftags::server;

const USAGE: &str = "\
ftags

Code-symbol index server for C/C++ codebases.

Usage:
  ftags [--help | --version]

Environment (defaults shown):
  XDG_CACHE_HOME=$HOME/.config    database directory root
  XDG_RUNTIME_DIR=/tmp            request socket directory
  FTAGS_SOCKET_NAME=ftags.socket  request socket file name
  RUST_LOG=info                   log filter

Databases are persisted under:
  $XDG_CACHE_HOME/ftags/project/<project-root>/project.data";

#[tokio::main]
async fn main() -> Result<()> {
    match std::env::args().nth(1).as_deref() {
        Some("-h" | "--help" | "help") => {
            println!("{USAGE}");
            return Ok(());
        }
        Some("-V" | "--version" | "version") => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting ftags server");

    let config = Config::from_env()?;

    if let Err(err) = server::run(config).await {
        error!(error = %err, "Server exited with error");
        return Err(err);
    }
    Ok(())
}
