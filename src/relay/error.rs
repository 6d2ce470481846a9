use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use super::envelope::UpstreamError;

/// Error type reported for failures raised by the relay itself.
pub const TYPE_RELAY: &str = "one_api_error";
/// Error type reported for failures raised by (or about) the upstream.
pub const TYPE_UPSTREAM: &str = "upstream_error";

/// Surface-level error codes.
pub mod codes {
    pub const BIND_REQUEST_BODY_FAILED: &str = "bind_request_body_failed";
    pub const PROMPT_MISSING: &str = "prompt_missing";
    pub const PROMPT_TOO_LONG: &str = "prompt_too_long";
    pub const N_NOT_WITHIN_RANGE: &str = "n_not_within_range";
    pub const SIZE_NOT_SUPPORTED: &str = "size_not_supported";
    pub const INVALID_IMAGE_DATA_URL: &str = "invalid_image_data_url";
    pub const INSUFFICIENT_USER_QUOTA: &str = "insufficient_user_quota";
    pub const GET_USER_QUOTA_FAILED: &str = "get_user_quota_failed";
    pub const READ_REQUEST_BODY_FAILED: &str = "read_request_body_failed";
    pub const UNMARSHAL_MODEL_MAPPING_FAILED: &str = "unmarshal_model_mapping_failed";
    pub const SET_REQUEST_BODY_FAILED: &str = "set_request_body_failed";
    pub const NEW_REQUEST_FAILED: &str = "new_request_failed";
    pub const CLOSE_REQUEST_BODY_FAILED: &str = "close_request_body_failed";
    pub const READ_RESPONSE_BODY_FAILED: &str = "read_response_body_failed";
    pub const UNMARSHAL_RESPONSE_BODY_FAILED: &str = "unmarshal_response_body_failed";
    pub const COPY_RESPONSE_BODY_FAILED: &str = "copy_response_body_failed";
    pub const DO_REQUEST_FAILED: &str = "do_request_failed";
    pub const BAD_RESPONSE_STATUS_CODE: &str = "bad_response_status_code";
}

/// A relay failure carrying everything needed to render the OpenAI error
/// JSON shape: `{"error": {"message", "type", "code", "param"}}`.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct RelayError {
    pub message: String,
    pub kind: String,
    pub code: String,
    pub param: Option<String>,
    pub status: StatusCode,
}

impl RelayError {
    /// Wrap an arbitrary failure under a relay error code.
    pub fn wrap(err: impl std::fmt::Display, code: &str, status: StatusCode) -> Self {
        Self {
            message: err.to_string(),
            kind: TYPE_RELAY.to_string(),
            code: code.to_string(),
            param: None,
            status,
        }
    }

    pub fn bad_request(message: impl Into<String>, code: &str) -> Self {
        Self::wrap(message.into(), code, StatusCode::BAD_REQUEST)
    }

    pub fn forbidden(message: impl Into<String>, code: &str) -> Self {
        Self::wrap(message.into(), code, StatusCode::FORBIDDEN)
    }

    pub fn internal(message: impl Into<String>, code: &str) -> Self {
        Self::wrap(message.into(), code, StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Generic wrapper for a non-2xx upstream status, used when the upstream
    /// body carries no parseable error object. `param` records the status.
    pub fn upstream_status(status: StatusCode) -> Self {
        Self {
            message: format!("bad response status code {}", status.as_u16()),
            kind: TYPE_UPSTREAM.to_string(),
            code: codes::BAD_RESPONSE_STATUS_CODE.to_string(),
            param: Some(status.as_u16().to_string()),
            status,
        }
    }

    /// Adopt the upstream's own error object, keeping its status.
    pub fn from_upstream(status: StatusCode, error: UpstreamError) -> Self {
        let kind = if error.kind.is_empty() {
            TYPE_UPSTREAM.to_string()
        } else {
            error.kind
        };
        Self {
            message: error.message,
            kind,
            code: error.code.unwrap_or_else(|| codes::BAD_RESPONSE_STATUS_CODE.to_string()),
            param: error.param,
            status,
        }
    }

    /// View of this error in the upstream shape, for the disable predicate.
    pub fn as_upstream(&self) -> UpstreamError {
        UpstreamError {
            message: self.message.clone(),
            kind: self.kind.clone(),
            param: self.param.clone(),
            code: Some(self.code.clone()),
        }
    }
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    code: &'a str,
    param: Option<&'a str>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                message: &self.message,
                kind: &self.kind,
                code: &self.code,
                param: self.param.as_deref(),
            },
        };
        (self.status, Json(&body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_with_code_and_status() {
        let err = RelayError::bad_request("prompt is required", codes::PROMPT_MISSING);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, codes::PROMPT_MISSING);
        assert_eq!(err.kind, TYPE_RELAY);
        assert!(err.param.is_none());
    }

    #[test]
    fn upstream_status_records_param() {
        let err = RelayError::upstream_status(StatusCode::BAD_GATEWAY);
        assert_eq!(err.param.as_deref(), Some("502"));
        assert_eq!(err.code, codes::BAD_RESPONSE_STATUS_CODE);
        assert_eq!(err.kind, TYPE_UPSTREAM);
    }

    #[test]
    fn from_upstream_keeps_the_vendor_error_type() {
        let err = RelayError::from_upstream(
            StatusCode::TOO_MANY_REQUESTS,
            UpstreamError {
                message: "quota exhausted".to_string(),
                kind: "insufficient_quota".to_string(),
                param: None,
                code: None,
            },
        );
        assert_eq!(err.kind, "insufficient_quota");
        assert_eq!(err.code, codes::BAD_RESPONSE_STATUS_CODE);
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
    }
}
