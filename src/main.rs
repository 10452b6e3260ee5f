use clap::Parser;
use ollama_proxy::{build_router, AppState, MetricsCollector, ProxyConfig, UpstreamClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "ollama-proxy",
    about = "Ollama-compatible gateway for any OpenAI-compatible backend",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ollama_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        println!("  1. ollama-proxy.toml (current directory)");
        if cfg!(target_os = "macos") {
            println!("  2. ~/Library/Application Support/ollama-proxy/config.toml");
        } else {
            println!("  2. $XDG_CONFIG_HOME/ollama-proxy/config.toml");
            println!("     ~/.config/ollama-proxy/config.toml");
        }
        println!("  3. ~/.ollama-proxy.toml");
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }

    let metrics = Arc::new(MetricsCollector::new(config.metrics.capacity));
    // Fails fast on a missing API key rather than at the first request
    let upstream = Arc::new(UpstreamClient::from_config(&config, Arc::clone(&metrics))?);

    info!("ollama-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Backend:   {}", config.effective_base_url());
    info!("  Port:      {}", config.port);
    info!("  Models:    {} mapped", config.models.len());
    info!(
        "  Retry:     {} attempts, breaker opens after {} failures",
        config.retry.max_attempts, config.breaker.failure_threshold
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        upstream,
        metrics,
    });

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!(
        "  Point Ollama clients at: OLLAMA_HOST=http://localhost:{}",
        config.port
    );

    axum::serve(listener, app).await?;

    Ok(())
}
