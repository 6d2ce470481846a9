use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use super::envelope::UpstreamError;

/// Kind of upstream account a channel points at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    #[default]
    OpenAi,
    Azure,
    Cloudflare,
    Custom,
}

impl ChannelType {
    /// Base URL used when neither the channel nor the ratio tables carry one.
    pub fn default_base_url(self) -> &'static str {
        match self {
            ChannelType::OpenAi => "https://api.openai.com",
            ChannelType::Cloudflare => "https://gateway.ai.cloudflare.com",
            ChannelType::Azure | ChannelType::Custom => "",
        }
    }
}

/// Whether a relay failure indicates the channel credential itself is dead.
///
/// Pure predicate; callers gate it on the `automatic_disable_channel` setting.
pub fn should_disable(error: Option<&UpstreamError>, status: StatusCode) -> bool {
    let Some(error) = error else {
        return false;
    };
    if status == StatusCode::UNAUTHORIZED {
        return true;
    }
    if error.kind == "insufficient_quota" {
        return true;
    }
    matches!(
        error.code.as_deref(),
        Some("invalid_api_key") | Some("account_deactivated")
    )
}
