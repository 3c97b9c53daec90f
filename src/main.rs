use clap::Parser;
use intercept_proxy::config::Config;
use intercept_proxy::ProxyServer;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "intercept-proxy")]
#[command(about = "An intercepting HTTP/HTTPS proxy with TLS termination")]
struct Cli {
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    listen_host: String,

    #[arg(short = 'p', long, default_value = "8080")]
    listen_port: u16,

    /// Hosts tunneled without interception; `*.domain` matches subdomains.
    #[arg(long)]
    pass_through: Vec<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut config = if let Some(config_path) = cli.config {
        Config::from_file(&config_path)?
    } else {
        Config::default()
    };
    config.listen_host = cli.listen_host;
    config.listen_port = cli.listen_port;
    if !cli.pass_through.is_empty() {
        config.connect_pass_through = cli.pass_through;
    }

    let server = Arc::new(ProxyServer::new(config)?);

    let shutdown = Arc::clone(&server);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("shutting down");
        shutdown.shutdown();
        std::process::exit(0);
    });

    server.run().await?;
    Ok(())
}
