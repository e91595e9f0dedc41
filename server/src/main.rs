use clap::Parser;
use terminus_core::config::Config;
use terminus_core::util::notify_on_sigint;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "terminus-server")]
#[command(about = "Execution engine for the Terminus DevOps agent", long_about = None)]
struct Cli {
    /// Address to listen on for client connections.
    #[arg(long, default_value = "127.0.0.1:8000")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let shutdown = notify_on_sigint();

    let listener = TcpListener::bind(&cli.listen).await?;
    terminus_server::serve(listener, config, shutdown).await?;
    Ok(())
}
