//! Multi-tenant relay gateway for OpenAI-compatible APIs.
//!
//! Client requests in the OpenAI wire dialect are admitted against a
//! per-user quota, rewritten for the selected upstream channel (OpenAI,
//! Azure OpenAI, Cloudflare AI gateway, or other compatible vendors),
//! forwarded streaming or buffered, and metered against the quota ledger on
//! completion.
//!
//! The [`relay`] module is the core pipeline; [`relay::http::router`] exposes
//! it as an axum router. Persistence is abstracted behind
//! [`relay::ledger::QuotaStore`]; authentication middleware supplies a
//! [`RelayContext`] request extension per request.

pub mod relay;
pub mod settings;

pub use relay::{should_disable, ChannelType, RelayContext, RelayError, RelayState};
pub use settings::RelaySettings;
