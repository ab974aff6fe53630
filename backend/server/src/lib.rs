//! Documentation of an anonymous voting platform with XP rewards.
//!
//! Anyone can answer a question without signing up. The first vote mints an
//! opaque bearer token, later votes present it to keep the same identity and
//! XP history. Votes are rate limited per IP and unique per voter per question.
//!
//!
//!
//! # General Infrastructure
//! - Reverse proxy in front, appends the client address to `X-Forwarded-For`.
//!   Set `TRUSTED_PROXY_HOPS` to the number of proxies, otherwise the header is ignored
//! - Stateless app containers, any number of them
//! - Redis holds everything durable, and every invariant that spans instances
//!
//!
//!
//! # Vote Lifecycle
//!
//! **Goal**: Return to the voter as soon as the vote is durable. Everything else happens later.
//!
//! - Rate budget, question, identity and duplicate checks run in order, each can reject
//! - Budget consumption and the vote write are one atomic Redis script
//! - The receipt carries the vote id, the voter token and the XP just earned
//! - A background job then recomputes the award, folds the day into the voter's
//!   streak, bumps counters and fires milestones
//!
//! See [`pipeline`] for the critical path and [`queue`] for the background half.
//!
//!
//!
//! # Notes
//!
//! ## XP
//! Totals are never stored on their own. A voter's XP is the sum of their ledger,
//! so a crashed or replayed job cannot leave a total out of sync.
//!
//! ## Stats
//! Counters are hot and losing a few seconds of them on a crash is acceptable.
//! They are coalesced in memory and written in batches, see [`stats`].
//!
//!
//!
//! # Setup
//!
//! View current docs.
//! ```sh
//! cargo doc --open
//! ```
//!
//! Run against an in-memory store.
//! ```sh
//! STORE_BACKEND=memory QUESTIONS_PATH=questions.json RUST_LOG=info cargo run --bin pulse
//! ```
//!
//! Hammer it.
//! ```sh
//! cargo run --bin tester -- --question q1 --count 200 --shared-token
//! ```
use std::{net::SocketAddr, time::Duration};

use axum::{
    Router,
    http::{
        Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod guard;
pub mod identity;
pub mod memory;
pub mod milestones;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod rate_limit;
pub mod redis_store;
pub mod routes;
pub mod state;
pub mod stats;
pub mod utils;
pub mod xp;

use config::Config;
use error::ServerError;
use routes::{health_handler, stats_handler, votes_handler};
use state::State;

pub async fn start_server() -> Result<(), ServerError> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let config = Config::load();
    let state = State::new(config).await?;

    info!("Starting server...");

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(60 * 60));

    let app = Router::new()
        .route("/votes", post(votes_handler))
        .route("/stats", get(stats_handler))
        .route("/healthz", get(health_handler))
        .layer(cors)
        .with_state(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    if let Err(e) = &served {
        error!("Server stopped unexpectedly: {e}");
    }

    info!("Server shutting down...");
    state.shutdown().await;

    Ok(served?)
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
