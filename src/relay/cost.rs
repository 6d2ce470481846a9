//! Quota cost computation.
//!
//! All pricing state lives in a [`RatioTables`] snapshot. The snapshot is
//! read-mostly; reconfiguration stores a fresh snapshot through the
//! `ArcSwap` held by the relay state, so in-flight requests keep the tables
//! they started with.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::channel::ChannelType;

/// Ratio applied to models missing from the table, so unpriced models stay
/// billable rather than free.
const FALLBACK_MODEL_RATIO: f64 = 30.0;

const QUOTA_PER_IMAGE_UNIT: f64 = 1000.0;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioTables {
    /// Model name to price multiplier, token-based models.
    pub model_ratio: HashMap<String, f64>,
    /// User-group discount multiplier.
    pub group_ratio: HashMap<String, f64>,
    /// Image model to size string to price multiplier.
    pub image_size_ratios: HashMap<String, HashMap<String, f64>>,
    /// Image model to maximum prompt length in bytes.
    pub image_prompt_length_limits: HashMap<String, usize>,
    /// Image model to inclusive `(min, max)` for the `n` parameter.
    pub image_generation_amounts: HashMap<String, (u32, u32)>,
    /// Channel type to base URL, overriding the compiled defaults.
    pub channel_base_urls: HashMap<ChannelType, String>,
}

impl Default for RatioTables {
    fn default() -> Self {
        Self {
            model_ratio: default_model_ratio(),
            group_ratio: default_group_ratio(),
            image_size_ratios: default_image_size_ratios(),
            image_prompt_length_limits: default_image_prompt_length_limits(),
            image_generation_amounts: default_image_generation_amounts(),
            channel_base_urls: HashMap::new(),
        }
    }
}

impl RatioTables {
    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn model_ratio(&self, model: &str) -> f64 {
        match self.model_ratio.get(model) {
            Some(ratio) => *ratio,
            None => {
                warn!(model, ratio = FALLBACK_MODEL_RATIO, "model ratio not set, using fallback");
                FALLBACK_MODEL_RATIO
            }
        }
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratio.get(group).copied().unwrap_or(1.0)
    }

    pub fn base_url(&self, channel_type: ChannelType) -> &str {
        self.channel_base_urls
            .get(&channel_type)
            .map(String::as_str)
            .unwrap_or_else(|| channel_type.default_base_url())
    }

    pub fn image_cost_ratio(&self, model: &str, size: &str) -> Option<f64> {
        self.image_size_ratios.get(model)?.get(size).copied()
    }

    pub fn image_prompt_length_limit(&self, model: &str) -> Option<usize> {
        self.image_prompt_length_limits.get(model).copied()
    }

    pub fn image_amount_range(&self, model: &str) -> Option<(u32, u32)> {
        self.image_generation_amounts.get(model).copied()
    }
}

/// Quota for a finished token-based relay.
pub fn completion_quota(ratio: f64, prompt_tokens: usize, completion_tokens: usize) -> i64 {
    (ratio * (prompt_tokens + completion_tokens) as f64) as i64
}

/// Quota estimate used for admission, with `max_tokens` as the output hint.
pub fn admission_quota(ratio: f64, prompt_tokens: usize, max_tokens: u32) -> i64 {
    (ratio * (prompt_tokens as f64 + f64::from(max_tokens))) as i64
}

/// Quota for an image generation of `n` images at the given size ratio.
pub fn image_quota(ratio: f64, size_ratio: f64, n: u32) -> i64 {
    (ratio * size_ratio * QUOTA_PER_IMAGE_UNIT) as i64 * i64::from(n)
}

fn default_model_ratio() -> HashMap<String, f64> {
    [
        ("gpt-3.5-turbo", 0.75),
        ("gpt-3.5-turbo-0301", 0.75),
        ("gpt-3.5-turbo-0613", 0.75),
        ("gpt-3.5-turbo-1106", 0.5),
        ("gpt-3.5-turbo-16k", 1.5),
        ("gpt-4", 15.0),
        ("gpt-4-0613", 15.0),
        ("gpt-4-32k", 30.0),
        ("gpt-4-1106-preview", 5.0),
        ("gpt-4-vision-preview", 5.0),
        ("gpt-4o", 2.5),
        ("gpt-4o-mini", 0.075),
        ("text-davinci-003", 10.0),
        ("text-embedding-ada-002", 0.05),
        ("text-embedding-3-small", 0.01),
        ("text-embedding-3-large", 0.065),
        ("dall-e-2", 8.0),
        ("dall-e-3", 20.0),
    ]
    .into_iter()
    .map(|(model, ratio)| (model.to_string(), ratio))
    .collect()
}

fn default_group_ratio() -> HashMap<String, f64> {
    [("default", 1.0), ("vip", 1.0), ("svip", 1.0)]
        .into_iter()
        .map(|(group, ratio)| (group.to_string(), ratio))
        .collect()
}

fn default_image_size_ratios() -> HashMap<String, HashMap<String, f64>> {
    let dalle2 = [("256x256", 1.0), ("512x512", 1.125), ("1024x1024", 1.25)]
        .into_iter()
        .map(|(size, ratio)| (size.to_string(), ratio))
        .collect();
    let dalle3 = [("1024x1024", 1.0), ("1024x1792", 2.0), ("1792x1024", 2.0)]
        .into_iter()
        .map(|(size, ratio)| (size.to_string(), ratio))
        .collect();
    [("dall-e-2".to_string(), dalle2), ("dall-e-3".to_string(), dalle3)]
        .into_iter()
        .collect()
}

fn default_image_prompt_length_limits() -> HashMap<String, usize> {
    [("dall-e-2", 1000), ("dall-e-3", 4000)]
        .into_iter()
        .map(|(model, limit)| (model.to_string(), limit))
        .collect()
}

fn default_image_generation_amounts() -> HashMap<String, (u32, u32)> {
    [("dall-e-2", (1, 10)), ("dall-e-3", (1, 1))]
        .into_iter()
        .map(|(model, range)| (model.to_string(), range))
        .collect()
}
