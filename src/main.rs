mod config;
mod error;
mod handlers;
mod limiter;
mod metrics;
mod middleware;
mod plan;
mod state;
mod store;
mod usage;

use axum::{
    Router,
    routing::{get, post},
};
use clap::Parser;
use config::Args;
use plan::Tier;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::{LimitStore, MemoryStore, RedisStore};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let default_tier = Tier::parse(&args.default_tier).unwrap_or_else(|| {
        warn!(tier = %args.default_tier, "unknown default tier, using basic");
        Tier::Basic
    });

    // Redis first for multi-instance deployments, in-process store otherwise
    let store: Arc<dyn LimitStore> = match &args.redis_url {
        Some(url) => match RedisStore::connect(url).await {
            Ok(store) => {
                info!(url = %url, "using redis limit store");
                Arc::new(store)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "redis unavailable, falling back to in-memory store");
                Arc::new(MemoryStore::new())
            }
        },
        None => {
            info!("using in-memory limit store");
            Arc::new(MemoryStore::new())
        }
    };

    let state = Arc::new(AppState::new(
        store.clone(),
        Duration::from_millis(args.store_timeout_ms),
        default_tier,
    ));

    // sweep window entries for subjects that stopped sending requests and
    // expired tier cache entries, otherwise both grow without bound
    let sweep_store = store.clone();
    let sweep_state = state.clone();
    let sweep_interval = Duration::from_secs(args.sweep_interval.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        // one window with no activity means the entry is dead weight
        let idle_ms = plan::PlanLimits::for_tier(Tier::Basic).window_ms();
        loop {
            ticker.tick().await;
            let now_ms = chrono::Utc::now().timestamp_millis();
            match sweep_store.sweep(now_ms, idle_ms).await {
                Ok(removed) if removed > 0 => {
                    debug!(removed, "swept idle window entries");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "window sweep failed"),
            }
            let evicted = sweep_state.plans.evict_expired(now_ms);
            if evicted > 0 {
                debug!(evicted, "evicted expired tier cache entries");
            }
        }
    });

    let app = Router::new()
        .route(
            "/api/surveys",
            post(handlers::create_survey_handler).get(handlers::list_surveys_handler),
        )
        .route("/api/responses", post(handlers::submit_response_handler))
        .route("/api/reports", post(handlers::create_report_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::limits_middleware,
        ))
        .route("/api/usage", get(handlers::usage_handler))
        .route(
            "/internal/subscriptions",
            post(handlers::set_subscription_handler),
        )
        .route("/internal/usage/reset", post(handlers::reset_usage_handler))
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(addr = %addr, error = %e, "failed to bind, is the port already in use?");
            std::process::exit(1);
        }
    };

    info!(port = args.port, "novora-limits gateway running");
    info!(
        default_tier = default_tier.as_str(),
        store_timeout_ms = args.store_timeout_ms,
        "limits pipeline configured"
    );

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        warn!(error = %e, "server exited");
    }
}
