//! The relay pipeline for image generation.
//!
//! Image requests are priced before dispatch from the size/quality tables, so
//! admission and commit both use the same fixed quota. The upstream reply is
//! buffered and re-emitted byte for byte.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use serde_json::Value;

use super::adapter::plan_upstream;
use super::context::RelayContext;
use super::cost::image_quota;
use super::envelope::ImageRequest;
use super::error::{codes, RelayError};
use super::executor::{
    apply_model_mapping, build_response, first_header_values, relay_error_from_upstream,
    MAX_REQUEST_BODY_BYTES,
};
use super::passthrough::{buffered_relay_body, Committer};
use super::RelayState;

const DEFAULT_IMAGE_MODEL: &str = "dall-e-2";
const DEFAULT_IMAGE_SIZE: &str = "1024x1024";

/// Relay one image generation request.
pub async fn relay_image(
    state: &RelayState,
    ctx: &RelayContext,
    req: Request<Body>,
) -> Result<Response, RelayError> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let raw_body = to_bytes(body, MAX_REQUEST_BODY_BYTES).await.map_err(|err| {
        RelayError::wrap(err, codes::READ_REQUEST_BODY_FAILED, StatusCode::INTERNAL_SERVER_ERROR)
    })?;
    let request: ImageRequest = serde_json::from_slice(&raw_body).map_err(|err| {
        RelayError::wrap(err, codes::BIND_REQUEST_BODY_FAILED, StatusCode::BAD_REQUEST)
    })?;

    let model = if request.model.is_empty() {
        DEFAULT_IMAGE_MODEL
    } else {
        request.model.as_str()
    };
    let size = if request.size.is_empty() {
        DEFAULT_IMAGE_SIZE
    } else {
        request.size.as_str()
    };

    let tables = state.tables.load_full();

    let Some(mut size_ratio) = tables.image_cost_ratio(model, size) else {
        return Err(RelayError::bad_request(
            "size not supported for this image model",
            codes::SIZE_NOT_SUPPORTED,
        ));
    };
    if request.quality == "hd" && model == "dall-e-3" {
        size_ratio *= if size == "1024x1024" { 2.0 } else { 1.5 };
    }

    if request.prompt.is_empty() {
        return Err(RelayError::bad_request("prompt is required", codes::PROMPT_MISSING));
    }
    if let Some(limit) = tables.image_prompt_length_limit(model) {
        if request.prompt.len() > limit {
            return Err(RelayError::bad_request("prompt is too long", codes::PROMPT_TOO_LONG));
        }
    }

    let n = if request.n == 0 { 1 } else { request.n };
    let within_range = tables
        .image_amount_range(model)
        .map(|(min, max)| n >= min && n <= max)
        .unwrap_or(false);
    if !within_range {
        return Err(RelayError::bad_request("invalid value of n", codes::N_NOT_WITHIN_RANGE));
    }

    let origin_model = model.to_string();
    let (upstream_model, forward_body) = apply_model_mapping(ctx, &origin_model, raw_body)?;
    let plan = plan_upstream(ctx, &tables, &path_and_query, &upstream_model, &parts.headers)?;

    let model_ratio = tables.model_ratio(&origin_model);
    let group_ratio = tables.group_ratio(&ctx.group);
    let quota = image_quota(model_ratio * group_ratio, size_ratio, n);

    state.ledger.admit(ctx, quota).await?;

    let upstream = state
        .client
        .request(parts.method.clone(), &plan.url)
        .headers(plan.headers)
        .body(forward_body)
        .send()
        .await
        .map_err(|err| {
            RelayError::wrap(err, codes::DO_REQUEST_FAILED, StatusCode::BAD_GATEWAY)
        })?;

    let status = upstream.status();
    if status.as_u16() >= 400 {
        return Err(relay_error_from_upstream(upstream).await);
    }

    let response_headers = first_header_values(upstream.headers());

    // The generation already happened upstream; the fixed cost settles on
    // every exit path from here on.
    let committer = Committer::fixed(
        state.ledger.clone(),
        ctx,
        &origin_model,
        model_ratio,
        group_ratio,
        quota,
    );

    let response_bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            committer.settle(0).await;
            return Err(RelayError::wrap(
                err,
                codes::READ_RESPONSE_BODY_FAILED,
                StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }
    };
    if ctx.consume_quota {
        if let Err(err) = serde_json::from_slice::<Value>(&response_bytes) {
            committer.settle(0).await;
            return Err(RelayError::wrap(
                err,
                codes::UNMARSHAL_RESPONSE_BODY_FAILED,
                StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }
    }

    let body = buffered_relay_body(response_bytes, 0, committer);
    Ok(build_response(status, response_headers, body))
}
