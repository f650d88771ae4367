//! kintod: the Kinto daemon.
//!
//! # Usage
//!
//! ```text
//! kintod serve --config /etc/kinto/kintod.toml --port 8470 --data-dir /var/lib/kinto
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kintod::DaemonConfig;

#[derive(Parser)]
#[command(name = "kintod", about = "Kinto control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the control plane API.
    Serve {
        /// Path to kintod.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `[server].port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `[storage].data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut daemon_config = match config {
                Some(path) => DaemonConfig::load(&path)?,
                None => DaemonConfig::default(),
            };
            daemon_config.override_with(port, data_dir);
            kintod::init_tracing(&daemon_config.log)?;
            kintod::run(daemon_config).await
        }
    }
}
