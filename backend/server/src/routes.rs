use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json,
    extract::{self, ConnectInfo, Query, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::AppError,
    pipeline::VoteSubmission,
    state::State,
    utils::{bearer_token, client_ip},
};

pub async fn votes_handler(
    extract::State(state): extract::State<Arc<State>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<VoteSubmission>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(submission) = payload.map_err(|e| {
        debug!("rejected vote body: {e}");
        AppError::MalformedPayload
    })?;

    let token = bearer_token(&headers)?;
    let source_ip = client_ip(&headers, peer, state.config.trusted_proxy_hops);

    let receipt = state.pipeline.submit(submission, token, &source_ip).await?;

    Ok((StatusCode::CREATED, Json(receipt)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    #[serde(default)]
    include_daily: bool,
}

pub async fn stats_handler(
    extract::State(state): extract::State<Arc<State>>,
    Query(query): Query<StatsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let summary = state.stats.summary(query.include_daily).await?;

    Ok(Json(summary))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    queue_depth: usize,
    pending_stats: usize,
}

pub async fn health_handler(extract::State(state): extract::State<Arc<State>>) -> impl IntoResponse {
    Json(Health {
        status: "ok",
        queue_depth: state.queue.depth(),
        pending_stats: state.stats.pending_len(),
    })
}
