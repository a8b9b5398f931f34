use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use ferry::backend::{ManagerConfig, TcpConnector};
use ferry::config::{self, Config};
use ferry::driver::Driver;
use ferry::router::{Router, StaticRouter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_or_default_config();

    let router = StaticRouter::new(config.backends.clone());
    let connector = Arc::new(TcpConnector::new(Duration::from_millis(
        config.proxy.connect_timeout_ms,
    )));
    let driver = Arc::new(Driver::new(
        router.clone(),
        connector,
        ManagerConfig::from(&config.proxy),
    ));

    info!(
        backends = ?config.backends,
        redirect_timeout_ms = config.proxy.redirect_timeout_ms,
        "Router configured"
    );

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;

    info!(addr = %addr, "Ferry MySQL proxy listening");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let signal_router = router.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutting down");
        signal_router.close();
        signal.cancel();
    });

    #[cfg(unix)]
    reload_on_hangup(router.clone());

    driver.serve(listener, shutdown).await?;
    Ok(())
}

/// On SIGHUP, re-read the backend list and drain connections off removed backends
#[cfg(unix)]
fn reload_on_hangup(router: Arc<StaticRouter>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                error!(error = %e, "Failed to install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            let Some(config) = find_config() else {
                warn!("No configuration file found, backend list unchanged");
                continue;
            };
            router.set_backends(config.backends);
            if let Err(e) = router.redirect_connections() {
                warn!(error = %e, "Failed to redirect connections");
            }
        }
    });
}

fn find_config() -> Option<Config> {
    let config_paths = ["config/ferry.toml", "ferry.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return Some(config);
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }
    None
}

fn load_or_default_config() -> Config {
    find_config().unwrap_or_else(|| {
        info!("Using default configuration");
        Config::default()
    })
}
