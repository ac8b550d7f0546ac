use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use wakegate::buffer::{ReplayTask, StatsLogTask, WebhookBuffer};
use wakegate::cache::TtlCache;
use wakegate::clients::{
    build_http_client, HttpCodeHosting, HttpIdler, HttpTenantDirectory, HttpTokenService,
};
use wakegate::config::Config;
use wakegate::dispatch::{Dispatcher, GatewayStats};
use wakegate::forward::Forwarder;
use wakegate::proxy::GatewayServer;
use wakegate::resolver::Resolver;
use wakegate::store::Store;
use wakegate::ui::UiFlow;

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wakegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Durable webhook store
    let store = Arc::new(Store::open(&config.storage.path)?);
    info!(path = %config.storage.path, "Webhook store opened");

    // Shared HTTP client for the external collaborators
    let http = build_http_client(config.server.response_timeout())?;

    let idler = Arc::new(HttpIdler::new(&config.upstream.idler_url, http.clone()));
    let tenant = Arc::new(HttpTenantDirectory::new(
        &config.upstream.tenant_url,
        http.clone(),
    ));
    let code_hosting = Arc::new(HttpCodeHosting::new(&config.upstream.wit_url, http.clone()));
    let tokens = Arc::new(HttpTokenService::new(&config.upstream.auth_url, http.clone()));

    let repo_cache = Arc::new(TtlCache::new(config.resolve.repo_cache_ttl()));
    let session_cache = Arc::new(TtlCache::new(config.session.cache_ttl()));
    let stats = Arc::new(GatewayStats::default());

    let resolver = Arc::new(Resolver::new(
        tenant,
        code_hosting,
        tokens.clone(),
        Arc::clone(&repo_cache),
        config.resolve.max_attempts,
        config.resolve.backoff(),
    ));

    let webhooks = WebhookBuffer::new(
        Arc::clone(&resolver),
        idler.clone(),
        Arc::clone(&store),
        Arc::clone(&stats),
        http.clone(),
    );

    let ui = UiFlow::new(
        Arc::clone(&resolver),
        idler.clone(),
        tokens,
        Arc::clone(&session_cache),
        config.session.cookie_prefix.clone(),
        config.session.idled_cookie.clone(),
        http.clone(),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        webhooks,
        ui,
        Forwarder::new(config.server.response_timeout()),
        Arc::clone(&session_cache),
        Arc::clone(&store),
        Arc::clone(&stats),
        config.webhook.source_header.clone(),
        config.webhook.source_prefix.clone(),
        config.session.cookie_prefix.clone(),
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Front-door server
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = GatewayServer::new(bind_addr, dispatcher, shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Background replay of buffered webhooks
    let replay = ReplayTask::new(
        Arc::clone(&store),
        idler,
        Arc::clone(&stats),
        http,
        config.webhook.replay_interval(),
        config.webhook.max_retries,
    );
    let replay_handle = tokio::spawn(replay.run(shutdown_rx.clone()));

    // Periodic counter/usage logging
    let stats_task = StatsLogTask::new(store, stats, config.storage.stats_log_interval());
    let stats_handle = tokio::spawn(stats_task.run(shutdown_rx.clone()));

    // Sweep expired cache entries so idle namespaces don't pin memory
    tokio::spawn(cache_purge_loop(repo_cache, session_cache, shutdown_rx));

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and wait for the tasks, bounded
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = replay_handle.await;
        let _ = stats_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn cache_purge_loop(
    repo_cache: Arc<TtlCache<wakegate::clients::Namespace>>,
    session_cache: Arc<TtlCache<wakegate::cache::CacheItem>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(60);

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                repo_cache.purge_expired();
                session_cache.purge_expired();
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        response_timeout_secs = config.server.response_timeout_secs,
        "Server configuration"
    );
    info!(
        idler = %config.upstream.idler_url,
        tenant = %config.upstream.tenant_url,
        wit = %config.upstream.wit_url,
        auth = %config.upstream.auth_url,
        "Upstream services"
    );
    info!(
        source_header = %config.webhook.source_header,
        source_prefix = %config.webhook.source_prefix,
        replay_interval_secs = config.webhook.replay_interval_secs,
        max_retries = config.webhook.max_retries,
        "Webhook settings"
    );
    info!(
        session_cookie_prefix = %config.session.cookie_prefix,
        idled_cookie = %config.session.idled_cookie,
        session_ttl_secs = config.session.cache_ttl_secs,
        repo_ttl_secs = config.resolve.repo_cache_ttl_secs,
        "Cache settings"
    );
}
