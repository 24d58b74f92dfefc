use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::ServiceExt;
use axum::http::{HeaderValue, Method, header};
use clap::Parser;
use reqwest::Client;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_balancer_rs::accounts::AccountStore;
use llm_balancer_rs::auth::{ClientKeysStore, RefreshManager};
use llm_balancer_rs::config::{Config, CorsMode};
use llm_balancer_rs::constants::{MAX_IN_FLIGHT_REQUESTS, REQUEST_IDLE_TIMEOUT};
use llm_balancer_rs::pricing::PricingTable;
use llm_balancer_rs::proxy::ProxyEngine;
use llm_balancer_rs::usage_cache::UsageCache;
use llm_balancer_rs::{AppState, BUILD_TIME, GIT_HASH, VERSION, db, maintenance, routes, scheduler, writer};

#[derive(Parser)]
#[command(name = "llm-balancer")]
#[command(about = "Load-balancing reverse proxy for LLM APIs")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "LLM_BALANCER_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "LLM_BALANCER_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env().expect("Invalid configuration");

    db::init_db(&config.db_path())
        .await
        .expect("Failed to initialize database");

    maintenance::run_startup_maintenance(&config)
        .await
        .expect("Startup maintenance failed");

    let host = args.host.unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);

    // Shared HTTP client with connection pooling. The read timeout is the
    // per-request idle cap; streaming responses may run far longer in total.
    let http_client = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .read_timeout(REQUEST_IDLE_TIMEOUT)
        .pool_max_idle_per_host(10)
        .build()
        .expect("Failed to create HTTP client");

    let (writer, writer_handle) = writer::spawn();

    let store = Arc::new(AccountStore::new());
    let client_keys = Arc::new(ClientKeysStore::new());
    let pricing = Arc::new(
        PricingTable::load()
            .await
            .expect("Failed to load pricing table"),
    );
    let refresh = Arc::new(RefreshManager::new(
        http_client.clone(),
        config.client_id.clone(),
        writer.clone(),
    ));
    let usage_cache = Arc::new(UsageCache::new());

    let engine = Arc::new(ProxyEngine {
        http_client: http_client.clone(),
        store: Arc::clone(&store),
        refresh: Arc::clone(&refresh),
        client_keys,
        writer: writer.clone(),
        pricing,
        usage_cache: Arc::clone(&usage_cache),
        retry: config.retry,
        session_duration_ms: config.session_duration_ms,
        default_agent_model: config.default_agent_model.clone(),
        max_body_bytes: config.max_body_bytes,
    });
    // The engine keeps its own clone; this one must not outlive shutdown
    drop(writer);

    let schedulers = vec![
        scheduler::spawn_auto_refresh(Arc::clone(&store), Arc::clone(&refresh)),
        scheduler::spawn_usage_poller(
            Arc::clone(&store),
            Arc::clone(&refresh),
            Arc::clone(&usage_cache),
            http_client.clone(),
        ),
        scheduler::spawn_session_sweep(),
    ];

    let state = Arc::new(AppState { engine });

    // CORS configuration based on environment
    let cors_origins = config.cors_mode.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };
            match &cors_origins {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(
                        url.host_str(),
                        Some("localhost") | Some("127.0.0.1") | Some("::1")
                    )
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("anthropic-version"),
            header::HeaderName::from_static("anthropic-beta"),
        ])
        .allow_credentials(true);

    match &config.cors_mode {
        CorsMode::AllowAll => info!("CORS: Allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: Localhost only"),
        CorsMode::AllowList(list) => info!("CORS: Allowing origins: {:?}", list),
    }

    let app = NormalizePath::trim_trailing_slash(
        routes::core_router(state)
            .layer(cors)
            .layer(tower::limit::GlobalConcurrencyLimitLayer::new(
                MAX_IN_FLIGHT_REQUESTS,
            )),
    );

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid address");
    info!(
        "Starting llm-balancer v{}-{} (built {})",
        VERSION, GIT_HASH, BUILD_TIME
    );
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .unwrap();

    // Stop background producers, then let the writer drain its queue so no
    // accepted telemetry is lost.
    info!("Shutting down; draining writer");
    for handle in schedulers {
        handle.abort();
    }
    drop(refresh);
    drop(store);
    drop(usage_cache);
    writer_handle.drain().await;
    info!("Shutdown complete");
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received shutdown signal");
}
