//! Deterministic token estimation.
//!
//! One process-wide [`TokenCounter`] owns the model-to-encoder registry. The
//! registry is filled from the configured model list at startup; names outside
//! the `gpt-3.5` / `gpt-4` families resolve lazily on first use. Encoders are
//! the `tiktoken-rs` process singletons, safe for concurrent encoding.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;
use tiktoken_rs::{tokenizer, CoreBPE};
use tracing::warn;

use super::envelope::{ContentPart, ImageDetail, ImageUrl, Message, MessageContent};

const VISION_MAX_LONG_SIDE: u32 = 2000;
const VISION_MAX_SHORT_SIDE: u32 = 768;
const VISION_TILE_SIDE: f64 = 512.0;
const LOW_DETAIL_IMAGE_TOKENS: usize = 85;
const TOKENS_PER_TILE: usize = 170;
/// Flat charge for an image that could not be fetched or decoded; matches the
/// worst-case high-detail charge of 85 + 4 tiles.
const FAILED_IMAGE_TOKENS: usize = 765;

const APPROXIMATE_TOKENS_PER_BYTE: f64 = 0.38;
const FUNCTION_SCHEMA_TOKEN_FACTOR: f64 = 0.6;

#[derive(Debug, Error)]
pub enum ImageTokenError {
    #[error("invalid image data url")]
    InvalidDataUrl,
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("image fetch timed out")]
    FetchTimeout,
    #[error("image format not recognized: {0}")]
    Probe(#[from] std::io::Error),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

pub struct TokenCounter {
    /// `Some(encoder)` for resolved names, `None` for configured names that
    /// resolve lazily on first use. Unconfigured names use the default.
    encoders: Mutex<HashMap<String, Option<&'static CoreBPE>>>,
    default_encoder: &'static CoreBPE,
    approximate: bool,
}

impl TokenCounter {
    pub fn new<I, S>(configured_models: I, approximate: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let gpt35_encoder = tiktoken_rs::cl100k_base_singleton();
        let gpt4_encoder = encoder_for_known_model("gpt-4").unwrap_or(gpt35_encoder);

        let mut encoders = HashMap::new();
        for model in configured_models {
            let model = model.as_ref();
            let encoder = if model.starts_with("gpt-3.5") {
                Some(gpt35_encoder)
            } else if model.starts_with("gpt-4") {
                Some(gpt4_encoder)
            } else {
                None
            };
            encoders.insert(model.to_string(), encoder);
        }

        Self {
            encoders: Mutex::new(encoders),
            default_encoder: gpt35_encoder,
            approximate,
        }
    }

    fn encoder_for(&self, model: &str) -> &'static CoreBPE {
        let mut encoders = match self.encoders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match encoders.get(model).copied() {
            Some(Some(encoder)) => encoder,
            Some(None) => {
                let encoder = encoder_for_known_model(model).unwrap_or_else(|| {
                    warn!(model, "no tokenizer known for model, using the default encoder");
                    self.default_encoder
                });
                encoders.insert(model.to_string(), Some(encoder));
                encoder
            }
            None => self.default_encoder,
        }
    }

    pub fn count_text(&self, text: &str, model: &str) -> usize {
        if self.approximate {
            return (text.len() as f64 * APPROXIMATE_TOKENS_PER_BYTE) as usize;
        }
        self.encoder_for(model).encode_with_special_tokens(text).len()
    }

    /// Chat-message token recipe.
    ///
    /// Every message follows `<|start|>{role/name}\n{content}<|end|>\n`; the
    /// reply is primed with `<|start|>assistant<|message|>`.
    pub fn count_messages(&self, messages: &[Message], model: &str) -> usize {
        let (tokens_per_message, tokens_per_name) = if model == "gpt-3.5-turbo-0301" {
            // With a name present the role is omitted.
            (4i64, -1i64)
        } else {
            (3i64, 1i64)
        };

        let mut total = 0i64;
        for message in messages {
            total += tokens_per_message;
            total += self.count_text(&message.role, model) as i64;
            match &message.content {
                Some(MessageContent::Text(text)) => {
                    total += self.count_text(text, model) as i64;
                }
                Some(MessageContent::Parts(parts)) => {
                    for part in parts {
                        if let ContentPart::Text { text } = part {
                            total += self.count_text(text, model) as i64;
                        }
                    }
                }
                None => {}
            }
            if let Some(name) = &message.name {
                total += tokens_per_name;
                total += self.count_text(name, model) as i64;
            }
        }
        total += 3;
        total.max(0) as usize
    }

    /// Token count of a completions `prompt` or embeddings `input` value: a
    /// single string, or an array of strings concatenated with no separator.
    pub fn count_input(&self, input: &Value, model: &str) -> usize {
        match input {
            Value::String(text) => self.count_text(text, model),
            Value::Array(items) => {
                let mut text = String::new();
                for item in items {
                    if let Value::String(piece) = item {
                        text.push_str(piece);
                    }
                }
                self.count_text(&text, model)
            }
            _ => 0,
        }
    }

    /// Token count of a function-calling spec. Function schemas compress well
    /// under the tokenizer, hence the 0.6 factor on the indented rendering.
    pub fn count_functions(
        &self,
        functions: Option<&Value>,
        function_call: Option<&Value>,
        model: &str,
    ) -> usize {
        let Some(functions) = functions else {
            return 0;
        };
        let indented = reformat_json(functions, true);
        let mut tokens =
            (self.count_text(&indented, model) as f64 * FUNCTION_SCHEMA_TOKEN_FACTOR) as usize;
        if let Some(call) = function_call {
            tokens += self.count_text(&reformat_json(call, false), model);
        }
        tokens
    }

    /// Token count of one vision input. Low detail is a flat charge; high and
    /// auto detail require the image dimensions.
    pub async fn count_image(
        &self,
        image: &ImageUrl,
        client: &reqwest::Client,
        fetch_timeout: Duration,
    ) -> Result<usize, ImageTokenError> {
        if image.detail == ImageDetail::Low {
            return Ok(LOW_DETAIL_IMAGE_TOKENS);
        }

        let buf = if image.url.starts_with("data:image/") {
            let payload = image
                .url
                .split_once(',')
                .map(|(_, payload)| payload)
                .ok_or(ImageTokenError::InvalidDataUrl)?;
            BASE64_STANDARD.decode(payload)?
        } else {
            let response = tokio::time::timeout(fetch_timeout, client.get(&image.url).send())
                .await
                .map_err(|_| ImageTokenError::FetchTimeout)??;
            let body = tokio::time::timeout(fetch_timeout, response.bytes())
                .await
                .map_err(|_| ImageTokenError::FetchTimeout)??;
            body.to_vec()
        };

        let (width, height) = image::ImageReader::new(Cursor::new(&buf))
            .with_guessed_format()?
            .into_dimensions()?;
        let (width, height) =
            fit_resolution(width, height, VISION_MAX_LONG_SIDE, VISION_MAX_SHORT_SIDE);

        let tiles = (f64::from(height) / VISION_TILE_SIDE).ceil() as usize
            * (f64::from(width) / VISION_TILE_SIDE).ceil() as usize;
        Ok(LOW_DETAIL_IMAGE_TOKENS + tiles * TOKENS_PER_TILE)
    }

    /// Token count of all vision inputs of a request. A failed image charges
    /// the flat penalty instead of failing the relay.
    pub async fn count_images(
        &self,
        images: &[&ImageUrl],
        client: &reqwest::Client,
        fetch_timeout: Duration,
    ) -> usize {
        let mut tokens = 0;
        for image in images {
            match self.count_image(image, client, fetch_timeout).await {
                Ok(count) => tokens += count,
                Err(err) => {
                    warn!(error = %err, "image token counting failed, charging flat penalty");
                    tokens += FAILED_IMAGE_TOKENS;
                }
            }
        }
        tokens
    }
}

/// Scale `(w, h)` down to fit the long/short side caps, preserving aspect.
pub fn fit_resolution(
    origin_width: u32,
    origin_height: u32,
    max_long_side: u32,
    max_short_side: u32,
) -> (u32, u32) {
    let mut width = f64::from(origin_width);
    let mut height = f64::from(origin_height);
    let ratio = width / height;

    if width > height {
        if width > f64::from(max_long_side) {
            width = f64::from(max_long_side);
            height = width / ratio;
        }
        if height > f64::from(max_short_side) {
            height = f64::from(max_short_side);
            width = height * ratio;
        }
    } else {
        if height > f64::from(max_long_side) {
            height = f64::from(max_long_side);
            width = height / ratio;
        }
        if width > f64::from(max_short_side) {
            width = f64::from(max_short_side);
            height = width * ratio;
        }
    }

    (width.floor() as u32, height.floor() as u32)
}

/// Re-render a JSON value compactly or indented. Used to normalize function
/// specs before counting.
pub fn reformat_json(value: &Value, indent: bool) -> String {
    if indent {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

fn encoder_for_known_model(model: &str) -> Option<&'static CoreBPE> {
    let tokenizer = tokenizer::get_tokenizer(model)?;
    Some(match tokenizer {
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::R50kBase | tokenizer::Tokenizer::Gpt2 => {
            tiktoken_rs::r50k_base_singleton()
        }
    })
}
