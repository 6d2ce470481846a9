//! Process-wide relay policy, read from the environment at startup.

use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RelaySettings {
    /// Estimate tokens as `len × 0.38` instead of encoding. Trades counting
    /// accuracy for throughput.
    pub approximate_tokens: bool,
    /// Honor the channel-disable predicate on relay failures.
    pub automatic_disable_channel: bool,
    /// Output-token ceiling assumed at admission when a request carries no
    /// `max_tokens`.
    pub admission_max_tokens: u32,
    /// Timeout for fetching remote vision inputs.
    pub image_fetch_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            approximate_tokens: false,
            automatic_disable_channel: false,
            admission_max_tokens: 1024,
            image_fetch_timeout: Duration::from_secs(15),
        }
    }
}

impl RelaySettings {
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(value) = env_flag("RELAY_APPROXIMATE_TOKENS") {
            settings.approximate_tokens = value;
        }
        if let Some(value) = env_flag("RELAY_AUTOMATIC_DISABLE_CHANNEL") {
            settings.automatic_disable_channel = value;
        }
        if let Some(value) = env_parse::<u32>("RELAY_ADMISSION_MAX_TOKENS") {
            settings.admission_max_tokens = value;
        }
        if let Some(secs) = env_parse::<u64>("RELAY_IMAGE_FETCH_TIMEOUT_SECS") {
            settings.image_fetch_timeout = Duration::from_secs(secs);
        }
        settings
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    Some(matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}
