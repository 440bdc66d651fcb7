mod cli;
mod config;
mod coordinator;
mod error;
mod handlers;
mod payload;
mod push;
mod session;
mod storage;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber;

use crate::{
    cli::{Cli, Commands},
    config::Config,
    coordinator::Coordinator,
    handlers::{
        badge_count, clear_badge, end_call, health_check, send_answer, send_ice_candidate,
        send_offer, subscribe, unsubscribe, vapid_public_key, AppState,
    },
    push::{Fanout, VapidSigner, WebPushTransport},
    storage::{RedisStore, Store},
};
use clap::Parser;

#[tokio::main]
async fn main() {
    // Initialize tracing with environment-based configuration
    // Default to WARN level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "warn");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env();

    // Initialize Redis-backed call and subscription storage
    let store: Arc<dyn Store> = match RedisStore::new(&config.redis_url).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to connect to Redis: {}", e);
            std::process::exit(1);
        }
    };

    // Build the push delivery stack. Without VAPID keys the relay still runs,
    // but pushes go out unsigned and most gateways will reject them.
    let vapid = match (&config.vapid_private_key_pem, &config.vapid_public_key) {
        (Some(pem), Some(public)) => {
            match VapidSigner::new(pem, public.clone(), config.vapid_subject.clone()) {
                Ok(signer) => Some(signer),
                Err(e) => {
                    error!("Invalid VAPID configuration: {}", e);
                    std::process::exit(1);
                }
            }
        }
        _ => {
            warn!("VAPID keys not configured; push requests will be unsigned");
            None
        }
    };
    let transport = match WebPushTransport::new(
        Duration::from_secs(config.push_timeout_seconds),
        vapid,
    ) {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to build push transport: {}", e);
            std::process::exit(1);
        }
    };

    let fanout = Fanout::new(store.clone(), Arc::new(transport));
    let coordinator = Coordinator::new(
        store.clone(),
        fanout,
        chrono::Duration::seconds(config.call_timeout_seconds),
    );

    // One-shot expiry sweep mode
    if let Some(Commands::Sweep) = cli.command {
        match coordinator.sweep_expired().await {
            Ok(count) => {
                info!("Swept {} expired call sessions", count);
                return;
            }
            Err(e) => {
                error!("Expiry sweep failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    // Otherwise, run as server
    info!("Starting Shorecall signaling relay on port {}", config.port);
    info!("Redis URL: {}", config.redis_url);
    info!("Ring timeout: {} seconds", config.call_timeout_seconds);

    // Background sweeper: rings that nobody answered become expired
    let sweeper = coordinator.clone();
    let sweep_interval = Duration::from_secs(config.sweep_interval_seconds);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep_expired().await {
                warn!("Expiry sweep failed: {}", e);
            }
        }
    });

    let state = AppState {
        coordinator,
        store,
        vapid_public_key: config.vapid_public_key.clone(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/notifications/vapid-key", get(vapid_public_key))
        .route("/notifications/subscribe", post(subscribe))
        .route("/notifications/unsubscribe", post(unsubscribe))
        .route("/notifications/clear-badge", post(clear_badge))
        .route("/user/badge-count", get(badge_count))
        .route("/webrtc/send-offer", post(send_offer))
        .route("/webrtc/send-answer", post(send_answer))
        .route("/webrtc/send-ice-candidate", post(send_ice_candidate))
        .route("/webrtc/end-call", post(end_call))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    // Create the listener
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("Shorecall listening on {}", addr);

    // Start the server
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
