use std::path::PathBuf;

use clap::Parser;

use testproxy::{
    config::{Config, DEFAULT_PORT, DEFAULT_RECORDINGS_DIR},
    logging::{self, LogFormat},
    proxy,
};

/// Record/replay HTTP and WebSocket proxy for deterministic end-to-end tests.
#[derive(Debug, Parser)]
#[command(name = "testproxy")]
struct Cli {
    /// Backend target URLs, selected round-robin
    #[arg(value_name = "TARGET_URL")]
    targets: Vec<String>,

    /// Port to listen on (1025-65535)
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory recording sessions are written to
    #[arg(long = "recordings-dir", visible_alias = "dir", default_value = DEFAULT_RECORDINGS_DIR)]
    recordings_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(cli.log_level.as_deref(), cli.log_format)?;
    let config = Config::from_args(&cli.targets, cli.port, cli.recordings_dir)?;

    let proxy = proxy::serve(&config).await?;
    eprintln!("listening on {}", proxy.listen_addr);
    tokio::signal::ctrl_c().await?;
    proxy.shutdown().await;

    Ok(())
}
