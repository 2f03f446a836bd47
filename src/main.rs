use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use boardlink::cli;
use boardlink::config::BoardlinkConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = cli::Cli::parse();

    // RUST_LOG wins over the configured level.  Logs go to stderr so they
    // don't interleave with terminal output on stdout.
    let config = BoardlinkConfig::load()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level())),
        )
        .with_writer(std::io::stderr)
        .init();

    cli::handle_cli_command(cli_args.command).await
}
