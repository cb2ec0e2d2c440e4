use clap::Parser;
use flowcapd::{app, cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = cli::Args::parse();
    if let Err(err) = app::run(args).await {
        tracing::error!(%err, "fatal error");
        std::process::exit(1);
    }
}
