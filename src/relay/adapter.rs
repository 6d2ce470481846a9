//! Per-vendor request rewriting.
//!
//! `plan_upstream` is a pure function of the request context and the inbound
//! path and headers. Body rewriting (model aliasing) happens separately in
//! the executor, on the buffered body.

use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};

use super::channel::ChannelType;
use super::context::RelayContext;
use super::cost::RatioTables;
use super::error::{codes, RelayError};

const CLOUDFLARE_GATEWAY_PREFIX: &str = "https://gateway.ai.cloudflare.com";

/// Where and how to dispatch one upstream request.
#[derive(Debug)]
pub struct UpstreamPlan {
    pub url: String,
    pub headers: HeaderMap,
}

/// Compute the upstream URL and outbound headers for a request.
///
/// `upstream_model` is the post-mapping model name; Azure routes it into the
/// deployment path segment.
pub fn plan_upstream(
    ctx: &RelayContext,
    tables: &RatioTables,
    path_and_query: &str,
    upstream_model: &str,
    inbound_headers: &HeaderMap,
) -> Result<UpstreamPlan, RelayError> {
    let base_url = if ctx.base_url.is_empty() {
        tables.base_url(ctx.channel_type).to_string()
    } else {
        ctx.base_url.clone()
    };

    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, query),
        None => (path_and_query, ""),
    };

    let url = match ctx.channel_type {
        ChannelType::Azure => {
            let task = path.strip_prefix("/v1/").unwrap_or(path);
            let api_version = query_param(query, "api-version")
                .unwrap_or_else(|| ctx.api_version.clone());
            format!("{base_url}/openai/deployments/{upstream_model}/{task}?api-version={api_version}")
        }
        ChannelType::OpenAi | ChannelType::Cloudflare
            if base_url.starts_with(CLOUDFLARE_GATEWAY_PREFIX) =>
        {
            // The Cloudflare gateway mounts the OpenAI API without the /v1
            // prefix.
            let stripped = path_and_query.strip_prefix("/v1").unwrap_or(path_and_query);
            format!("{base_url}{stripped}")
        }
        _ => format!("{base_url}{path_and_query}"),
    };

    let mut headers = HeaderMap::new();
    match ctx.channel_type {
        ChannelType::Azure => {
            let key = if ctx.api_key.is_empty() {
                bearer_token(inbound_headers).unwrap_or_default()
            } else {
                ctx.api_key.clone()
            };
            headers.insert("api-key", header_value(&key)?);
        }
        _ => {
            if ctx.api_key.is_empty() {
                if let Some(authorization) = inbound_headers.get(AUTHORIZATION) {
                    headers.insert(AUTHORIZATION, authorization.clone());
                }
            } else {
                headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", ctx.api_key))?);
            }
        }
    }

    for name in [CONTENT_TYPE, ACCEPT] {
        if let Some(value) = inbound_headers.get(&name) {
            headers.insert(name, value.clone());
        }
    }

    Ok(UpstreamPlan { url, headers })
}

fn header_value(value: &str) -> Result<HeaderValue, RelayError> {
    HeaderValue::from_str(value).map_err(|err| {
        RelayError::wrap(err, codes::NEW_REQUEST_FAILED, StatusCode::INTERNAL_SERVER_ERROR)
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let authorization = headers.get(AUTHORIZATION)?.to_str().ok()?;
    Some(
        authorization
            .strip_prefix("Bearer ")
            .unwrap_or(authorization)
            .to_string(),
    )
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_ctx(base_url: &str) -> RelayContext {
        RelayContext {
            channel_type: ChannelType::OpenAi,
            base_url: base_url.to_string(),
            api_key: "sk-upstream".to_string(),
            ..RelayContext::default()
        }
    }

    #[test]
    fn default_channel_concatenates_base_and_path() {
        let ctx = openai_ctx("https://api.openai.com");
        let plan = plan_upstream(
            &ctx,
            &RatioTables::default(),
            "/v1/chat/completions",
            "gpt-3.5-turbo",
            &HeaderMap::new(),
        )
        .expect("plan");
        assert_eq!(plan.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            plan.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer sk-upstream")
        );
    }

    #[test]
    fn empty_base_url_uses_the_channel_default() {
        let mut ctx = openai_ctx("");
        ctx.api_key = String::new();
        let mut inbound = HeaderMap::new();
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-client"));

        let plan = plan_upstream(
            &ctx,
            &RatioTables::default(),
            "/v1/embeddings",
            "text-embedding-ada-002",
            &inbound,
        )
        .expect("plan");
        assert_eq!(plan.url, "https://api.openai.com/v1/embeddings");
        // No channel key configured: the inbound header passes through.
        assert_eq!(
            plan.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer sk-client")
        );
    }

    #[test]
    fn cloudflare_gateway_strips_the_v1_prefix() {
        let ctx = openai_ctx("https://gateway.ai.cloudflare.com/v1/acct/gw/openai");
        let plan = plan_upstream(
            &ctx,
            &RatioTables::default(),
            "/v1/chat/completions",
            "gpt-3.5-turbo",
            &HeaderMap::new(),
        )
        .expect("plan");
        assert_eq!(
            plan.url,
            "https://gateway.ai.cloudflare.com/v1/acct/gw/openai/chat/completions"
        );
    }

    #[test]
    fn azure_rewrites_url_and_auth_header() {
        let ctx = RelayContext {
            channel_type: ChannelType::Azure,
            base_url: "https://acme.openai.azure.com".to_string(),
            api_key: "azure-key".to_string(),
            api_version: "2024-02-15".to_string(),
            ..RelayContext::default()
        };
        let mut inbound = HeaderMap::new();
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer azure-key"));

        let plan = plan_upstream(
            &ctx,
            &RatioTables::default(),
            "/v1/chat/completions",
            "gpt-4-dep",
            &inbound,
        )
        .expect("plan");
        assert_eq!(
            plan.url,
            "https://acme.openai.azure.com/openai/deployments/gpt-4-dep/chat/completions?api-version=2024-02-15"
        );
        assert_eq!(
            plan.headers.get("api-key").and_then(|v| v.to_str().ok()),
            Some("azure-key")
        );
        assert!(plan.headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn azure_prefers_the_query_api_version() {
        let ctx = RelayContext {
            channel_type: ChannelType::Azure,
            base_url: "https://acme.openai.azure.com".to_string(),
            api_key: "azure-key".to_string(),
            api_version: "2023-05-15".to_string(),
            ..RelayContext::default()
        };
        let plan = plan_upstream(
            &ctx,
            &RatioTables::default(),
            "/v1/images/generations?api-version=2024-02-15",
            "dalle3-dep",
            &HeaderMap::new(),
        )
        .expect("plan");
        assert_eq!(
            plan.url,
            "https://acme.openai.azure.com/openai/deployments/dalle3-dep/images/generations?api-version=2024-02-15"
        );
    }
}
