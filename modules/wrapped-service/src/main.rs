//! Wrapped scraper service — waitlist, background worker pool, and RPC API.
//!
//! Users join a persisted waitlist; a single-run worker pool drains it under
//! the platform's rate limits using a pool of bot tokens, then stores each
//! user's wrapped statistics and notifies them over a direct message.
//! Default: http://127.0.0.1:9107/

mod aux_stats;
mod config;
mod db;
mod groups;
mod routes;
mod scraper;
mod slack_api;
#[cfg(test)]
mod testutil;
mod worker;

use routes::AppState;
use slack_api::{SlackApi, TokenPool};
use std::sync::Arc;
use std::time::Instant;

/// Retry budget for interactive RPC lookups; the worker pool uses the much
/// larger configured budget.
const INTERACTIVE_RETRY_ROUNDS: usize = 5;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let cfg = config::Config::from_env();

    let pool = TokenPool::from_env();
    if pool.is_empty() {
        log::warn!("SLACK_BOT_TOKENS not set — running on user tokens only");
    }

    log::info!("Opening database at: {}", cfg.db_path);
    let database = Arc::new(db::Db::open(&cfg.db_path).expect("Failed to open database"));

    let worker_api = Arc::new(SlackApi::new(
        cfg.slack_api_base.clone(),
        pool.clone(),
        cfg.retry_rounds,
    ));
    let interactive_api = Arc::new(SlackApi::new(
        cfg.slack_api_base.clone(),
        pool,
        INTERACTIVE_RETRY_ROUNDS,
    ));

    let workers = worker::WorkerPool::new(database.clone(), worker_api, cfg.clone());
    let aux = aux_stats::AuxClients::new(cfg.hackatime_base.clone(), cfg.ysws_base.clone());

    let state = Arc::new(AppState {
        db: database,
        api: interactive_api,
        workers,
        aux,
        start_time: Instant::now(),
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        // Waitlist
        .route("/rpc/waitlist/join", axum::routing::post(routes::waitlist_join))
        .route(
            "/rpc/waitlist/position",
            axum::routing::get(routes::waitlist_position),
        )
        // Worker control
        .route("/rpc/worker/run", axum::routing::post(routes::worker_run))
        .route("/rpc/worker/status", axum::routing::get(routes::worker_status))
        // Wrapped data
        .route("/rpc/wrapped/get", axum::routing::get(routes::wrapped_get))
        .route(
            "/rpc/wrapped/delete",
            axum::routing::post(routes::wrapped_delete),
        )
        // Upload path
        .route(
            "/rpc/secret/generate",
            axum::routing::post(routes::secret_generate),
        )
        .route("/rpc/upload", axum::routing::post(routes::upload))
        // Service
        .route("/rpc/status", axum::routing::get(routes::status))
        .with_state(state)
        .layer(cors);

    let addr = format!("127.0.0.1:{}", cfg.port);
    log::info!("Wrapped service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}
