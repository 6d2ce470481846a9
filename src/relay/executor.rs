//! The relay pipeline for token-based requests.
//!
//! One pass per request: parse, resolve the channel plan, estimate the cost,
//! admit against the quota ledger, dispatch, then relay the reply back while
//! arranging the deferred commit. The request body is buffered once and
//! shared by counting and dispatch.

use std::collections::HashMap;

use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde_json::Value;

use super::adapter::plan_upstream;
use super::context::RelayContext;
use super::cost::admission_quota;
use super::envelope::{GeneralRequest, ImageUrl, TextResponse};
use super::error::{codes, RelayError};
use super::passthrough::{
    buffered_relay_body, set_event_stream_headers, streaming_relay_body, Committer, SseLimits,
};
use super::RelayState;

pub(crate) const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Which relay flow a request path selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    ImageGenerations,
}

impl RelayMode {
    pub fn from_path(path: &str) -> Self {
        if path.contains("/chat/completions") {
            RelayMode::ChatCompletions
        } else if path.contains("/embeddings") {
            RelayMode::Embeddings
        } else if path.contains("/images/generations") {
            RelayMode::ImageGenerations
        } else {
            RelayMode::Completions
        }
    }
}

/// Relay one chat-completions, completions or embeddings request.
pub async fn relay_text(
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
    let mode = RelayMode::from_path(parts.uri.path());

    let raw_body = to_bytes(body, MAX_REQUEST_BODY_BYTES).await.map_err(|err| {
        RelayError::wrap(err, codes::READ_REQUEST_BODY_FAILED, StatusCode::INTERNAL_SERVER_ERROR)
    })?;
    let request: GeneralRequest = serde_json::from_slice(&raw_body).map_err(|err| {
        RelayError::wrap(err, codes::BIND_REQUEST_BODY_FAILED, StatusCode::BAD_REQUEST)
    })?;

    let origin_model = request.model.clone();
    let (upstream_model, forward_body) = apply_model_mapping(ctx, &origin_model, raw_body)?;

    let tables = state.tables.load_full();
    let plan = plan_upstream(ctx, &tables, &path_and_query, &upstream_model, &parts.headers)?;

    // Billing always uses the client-visible model name.
    let model_ratio = tables.model_ratio(&origin_model);
    let group_ratio = tables.group_ratio(&ctx.group);
    let ratio = model_ratio * group_ratio;

    let prompt_tokens = match mode {
        RelayMode::ChatCompletions => {
            let mut tokens = state.counter.count_messages(&request.messages, &origin_model);
            tokens += state.counter.count_functions(
                request.functions.as_ref(),
                request.function_call.as_ref(),
                &origin_model,
            );
            let images: Vec<&ImageUrl> = request
                .messages
                .iter()
                .flat_map(|message| message.image_parts())
                .collect();
            if !images.is_empty() {
                tokens += state
                    .counter
                    .count_images(&images, &state.client, state.settings.image_fetch_timeout)
                    .await;
            }
            tokens
        }
        RelayMode::Completions => request
            .prompt
            .as_ref()
            .map(|prompt| state.counter.count_input(prompt, &origin_model))
            .unwrap_or(0),
        RelayMode::Embeddings => request
            .input
            .as_ref()
            .map(|input| state.counter.count_input(input, &origin_model))
            .unwrap_or(0),
        RelayMode::ImageGenerations => 0,
    };

    let max_tokens = request
        .max_tokens
        .unwrap_or(state.settings.admission_max_tokens);
    let estimate = admission_quota(ratio, prompt_tokens, max_tokens);
    state.ledger.admit(ctx, estimate).await?;

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

    let mut response_headers = first_header_values(upstream.headers());

    // Past this point billable work has happened; every exit path settles
    // through the committer.
    let mut committer = Committer::per_token(
        state.ledger.clone(),
        ctx,
        &origin_model,
        model_ratio,
        group_ratio,
        prompt_tokens,
    );

    if request.stream {
        set_event_stream_headers(&mut response_headers);
        let body = streaming_relay_body(
            upstream,
            state.counter.clone(),
            origin_model,
            committer,
            SseLimits::default(),
        );
        return Ok(build_response(status, response_headers, body));
    }

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
    let parsed: TextResponse = match serde_json::from_slice(&response_bytes) {
        Ok(parsed) => parsed,
        Err(err) => {
            committer.settle(0).await;
            return Err(RelayError::wrap(
                err,
                codes::UNMARSHAL_RESPONSE_BODY_FAILED,
                StatusCode::INTERNAL_SERVER_ERROR,
            ));
        }
    };

    // Observed usage wins over our own estimate; when the upstream reports
    // none, fall back to counting the reply content.
    let completion_tokens = if parsed.usage.total_tokens == 0 {
        parsed
            .choices
            .iter()
            .filter_map(|choice| {
                choice
                    .message
                    .as_ref()
                    .and_then(|message| message.content.as_deref())
                    .or(choice.text.as_deref())
            })
            .map(|content| state.counter.count_text(content, &origin_model))
            .sum()
    } else {
        committer.set_prompt_tokens(parsed.usage.prompt_tokens as usize);
        parsed.usage.completion_tokens as usize
    };

    let body = buffered_relay_body(response_bytes, completion_tokens, committer);
    Ok(build_response(status, response_headers, body))
}

/// Rewrite the buffered body's `model` field when the channel maps the
/// requested name. Returns the upstream-facing model plus the body to
/// forward; billing keeps the original name.
pub(crate) fn apply_model_mapping(
    ctx: &RelayContext,
    origin_model: &str,
    raw_body: Bytes,
) -> Result<(String, Bytes), RelayError> {
    let Some(mapping_raw) = ctx.model_mapping.as_deref().filter(|raw| !raw.is_empty()) else {
        return Ok((origin_model.to_string(), raw_body));
    };
    let mapping: HashMap<String, String> = serde_json::from_str(mapping_raw).map_err(|err| {
        RelayError::wrap(
            err,
            codes::UNMARSHAL_MODEL_MAPPING_FAILED,
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;
    let Some(mapped) = mapping.get(origin_model).filter(|mapped| !mapped.is_empty()) else {
        return Ok((origin_model.to_string(), raw_body));
    };

    let mut value: Value = serde_json::from_slice(&raw_body).map_err(|err| {
        RelayError::wrap(err, codes::SET_REQUEST_BODY_FAILED, StatusCode::INTERNAL_SERVER_ERROR)
    })?;
    value["model"] = Value::String(mapped.clone());
    let rewritten = serde_json::to_vec(&value).map_err(|err| {
        RelayError::wrap(err, codes::SET_REQUEST_BODY_FAILED, StatusCode::INTERNAL_SERVER_ERROR)
    })?;
    Ok((mapped.clone(), Bytes::from(rewritten)))
}

/// Upstream returned a non-2xx status: adopt its error object when the body
/// carries one, else wrap the bare status. Either way the relay aborts
/// without commit.
pub(crate) async fn relay_error_from_upstream(response: reqwest::Response) -> RelayError {
    let status = response.status();
    let fallback = RelayError::upstream_status(status);
    let Ok(body) = response.bytes().await else {
        return fallback;
    };
    let Ok(parsed) = serde_json::from_slice::<TextResponse>(&body) else {
        return fallback;
    };
    match parsed.error {
        Some(error) => RelayError::from_upstream(status, error),
        None => fallback,
    }
}

/// Copy the first value of each upstream header.
pub(crate) fn first_header_values(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if !headers.contains_key(name) {
            headers.insert(name.clone(), value.clone());
        }
    }
    headers
}

pub(crate) fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
