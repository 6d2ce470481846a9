use super::channel::ChannelType;

/// Per-request relay context.
///
/// Populated by the authentication middleware in front of the router (as a
/// request extension) and read-only inside the pipeline. `model_mapping` is
/// the raw per-channel alias table as stored, parsed lazily per request.
#[derive(Clone, Debug, Default)]
pub struct RelayContext {
    pub user_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub base_url: String,
    pub api_key: String,
    pub group: String,
    pub model_mapping: Option<String>,
    pub consume_quota: bool,
    pub api_version: String,
}
