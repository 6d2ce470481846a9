//! The relay core: request ingestion, channel resolution, request rewriting,
//! quota pre-check, upstream dispatch with streaming passthrough, token
//! accounting and the deferred ledger commit.

pub mod adapter;
pub mod channel;
pub mod context;
pub mod cost;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod http;
pub mod image;
pub mod ledger;
pub mod passthrough;
pub mod token_count;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::warn;

use crate::settings::RelaySettings;
use cost::RatioTables;
use ledger::{QuotaLedger, QuotaStore};
use token_count::TokenCounter;

pub use channel::{should_disable, ChannelType};
pub use context::RelayContext;
pub use error::RelayError;

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Hook invoked when a relay failure indicates the channel should be
/// disabled. The admin layer installs its own; the default just logs.
pub type ChannelDisableHook = Arc<dyn Fn(i64, &str) + Send + Sync>;

/// Shared state behind the relay router.
///
/// Everything here is either immutable after startup (settings, encoder
/// registry, HTTP client) or an atomically swapped snapshot (ratio tables),
/// so handlers never hold locks across suspension points.
#[derive(Clone)]
pub struct RelayState {
    pub settings: RelaySettings,
    pub counter: Arc<TokenCounter>,
    pub tables: Arc<ArcSwap<RatioTables>>,
    pub ledger: QuotaLedger,
    pub client: reqwest::Client,
    pub on_channel_disable: ChannelDisableHook,
}

impl RelayState {
    pub fn new(
        settings: RelaySettings,
        store: Arc<dyn QuotaStore>,
    ) -> Result<Self, reqwest::Error> {
        Self::with_tables(settings, store, RatioTables::default())
    }

    pub fn with_tables(
        settings: RelaySettings,
        store: Arc<dyn QuotaStore>,
        tables: RatioTables,
    ) -> Result<Self, reqwest::Error> {
        let counter = TokenCounter::new(
            tables.model_ratio.keys().map(String::as_str),
            settings.approximate_tokens,
        );
        let client = reqwest::Client::builder()
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            settings,
            counter: Arc::new(counter),
            tables: Arc::new(ArcSwap::from_pointee(tables)),
            ledger: QuotaLedger::new(store),
            client,
            on_channel_disable: Arc::new(|channel_id, reason| {
                warn!(channel_id, reason, "channel flagged for automatic disable");
            }),
        })
    }

    pub fn with_channel_disable_hook(mut self, hook: ChannelDisableHook) -> Self {
        self.on_channel_disable = hook;
        self
    }

    /// Swap in a fresh cost-table snapshot. In-flight requests keep the
    /// snapshot they loaded.
    pub fn reload_tables(&self, tables: RatioTables) {
        self.tables.store(Arc::new(tables));
    }
}
