//! Documentation of the ShareCart group-ordering backend.
//!
//! Neighbors share a delivery cart to split the delivery charge: one user
//! creates a cart for a platform, nearby users join it, everyone pays their
//! share, and the order moves out for delivery once the last share clears.
//!
//!
//!
//! # General Infrastructure
//! - One axum binary serving the JSON API and the websocket relay
//! - Redis is the only store; documents are JSON blobs under typed keys
//! - Joinable carts carry a Redis TTL so abandoned carts expire on their own
//! - REST handlers and sockets publish into the same in-process rooms, so
//!   an HTTP join still reaches every connected cart member
//!
//!
//!
//! # Split Accounting
//!
//! **Goal**: nobody fronts more than their share once the cart fills up.
//!
//! - The creator starts as the only member carrying the full delivery charge
//! - Every join/leave recomputes `splitAmount = ceil(charge / members)`
//! - Checkout snapshots the membership into an order; payments reconcile
//!   against that snapshot, not the live cart
//! - Each payment confirmation is HMAC-signed; the last one flips the order
//!   to confirmed and the cart into ordering
//!
//!
//!
//! # Notes
//!
//! ## Redis
//! Lookups here are by key or by small membership sets, and cart expiry is a
//! TTL. An in-memory database gives both for free, and the whole working set
//! is tiny (a few KB per cart with members and chat inlined). Scans over the
//! cart index are fine at the neighborhood scale this runs at.
use std::time::Duration;

use axum::{
    Json, Router,
    http::{
        HeaderValue, Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use serde_json::json;

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod auth;
pub mod carts;
pub mod config;
pub mod database;
pub mod error;
pub mod geo;
pub mod messages;
pub mod models;
pub mod payments;
pub mod reviews;
pub mod state;
pub mod utils;
pub mod ws;

use state::AppState;

pub async fn start_server() {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = AppState::new().await;

    info!("Starting server...");

    let cors = CorsLayer::new()
        .allow_origin(
            state
                .config
                .client_url
                .parse::<HeaderValue>()
                .expect("CLIENT_URL must be a valid origin"),
        )
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws::ws_handler))
        .nest("/api/auth", auth::router())
        .nest("/api/carts", carts::router())
        .nest("/api/payments", payments::router())
        .nest("/api/orders", payments::orders_router())
        .nest("/api/messages", messages::router())
        .nest("/api/reviews", reviews::router())
        .layer(cors)
        .with_state(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await.unwrap();
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    println!("Server shutting down...");
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "success": true,
        "message": "ShareCart API is running",
        "timestamp": Utc::now(),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
