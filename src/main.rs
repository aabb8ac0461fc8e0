//! personactl CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use personactl::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Load env files first so RUST_LOG from .env applies.
    personactl::bootstrap::load_personactl_env();
    init_tracing(cli.debug, cli.log_json);

    personactl::cli::run(cli).await
}

fn init_tracing(debug: bool, json: bool) {
    let default = if debug { "personactl=debug" } else { "personactl=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
