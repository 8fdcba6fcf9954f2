use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (HUBLINE_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("HUBLINE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("hubline_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = hubline_server::config::ServerConfig::parse();
    tracing::info!("Starting hub on {}", config.listen_addr);
    if config.db_path.is_none() {
        tracing::info!("Set --db-path to keep groups across restarts");
    }

    let server = hubline_server::server::Server::new(config);
    server.run().await
}
