use clap::Parser;

use pwapack::config::ServerConfig;
use pwapack::server;

#[derive(Parser)]
#[command(name = "pwapack", about = "PWA to signed-APK packaging server")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Development mode: allow http/private URLs and permissive CORS
    #[arg(long)]
    dev: bool,

    /// Maximum number of builds admitted at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Seconds before an unclaimed build is deleted
    #[arg(long)]
    ttl_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::from_env();
    config.port = cli.port;
    config.dev_mode = cli.dev;
    if let Some(max) = cli.max_concurrent {
        config.max_concurrent = max;
    }
    if let Some(secs) = cli.ttl_secs {
        config.job_ttl = std::time::Duration::from_secs(secs);
    }

    server::start_server(config).await
}
