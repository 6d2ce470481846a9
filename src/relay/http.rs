//! The inbound HTTP surface of the relay.
//!
//! The router exposes the OpenAI-compatible relay endpoints. Authentication
//! middleware in front of the router is expected to insert a
//! [`RelayContext`] request extension; requests without one are rejected by
//! the extractor before the pipeline runs.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;

use super::channel::should_disable;
use super::context::RelayContext;
use super::error::RelayError;
use super::executor::relay_text;
use super::image::relay_image;
use super::RelayState;

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat/completions", post(handle_relay_text))
        .route("/v1/completions", post(handle_relay_text))
        .route("/v1/embeddings", post(handle_relay_text))
        .route("/v1/images/generations", post(handle_relay_image))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn handle_relay_text(
    State(state): State<RelayState>,
    Extension(ctx): Extension<RelayContext>,
    req: Request<Body>,
) -> Response {
    match relay_text(&state, &ctx, req).await {
        Ok(response) => response,
        Err(err) => finish_error(&state, &ctx, err),
    }
}

async fn handle_relay_image(
    State(state): State<RelayState>,
    Extension(ctx): Extension<RelayContext>,
    req: Request<Body>,
) -> Response {
    match relay_image(&state, &ctx, req).await {
        Ok(response) => response,
        Err(err) => finish_error(&state, &ctx, err),
    }
}

fn finish_error(state: &RelayState, ctx: &RelayContext, err: RelayError) -> Response {
    if state.settings.automatic_disable_channel
        && should_disable(Some(&err.as_upstream()), err.status)
    {
        (state.on_channel_disable)(ctx.channel_id, &err.message);
    }
    err.into_response()
}
