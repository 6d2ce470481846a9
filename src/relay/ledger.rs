//! Two-phase quota ledger.
//!
//! Admission is a synchronous balance check against the cached user quota; no
//! reservation is persisted, trading a small over-admission window for cheap
//! ledger writes under load. Commit runs once billable work began, decrements
//! the token balance by the observed cost and refreshes the cached user
//! quota. Every commit step is best-effort: the consume-log record is
//! authoritative for reconciliation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::StatusCode;
use thiserror::Error;
use tracing::error;

use super::context::RelayContext;
use super::error::{codes, RelayError};

#[derive(Debug, Error)]
#[error("quota store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One row of the consume log.
#[derive(Clone, Debug)]
pub struct ConsumeLogEntry {
    pub user_id: i64,
    pub channel_id: i64,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub model: String,
    pub token_name: String,
    pub quota: i64,
    pub note: String,
}

/// External persistence the ledger drives. Implemented by the SQL-backed
/// stores outside this crate and by [`MemoryQuotaStore`] for tests and
/// single-node development.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn cache_get_user_quota(&self, user_id: i64) -> Result<i64, StoreError>;
    async fn post_consume_token_quota(&self, token_id: i64, delta: i64) -> Result<(), StoreError>;
    async fn cache_update_user_quota(&self, user_id: i64) -> Result<(), StoreError>;
    async fn update_user_used_quota_and_request_count(&self, user_id: i64, delta: i64);
    async fn update_channel_used_quota(&self, channel_id: i64, delta: i64);
    async fn record_consume_log(&self, entry: ConsumeLogEntry);
}

/// Final charge of one relay, handed to [`QuotaLedger::commit`].
#[derive(Clone, Debug)]
pub struct QuotaCharge {
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub token_name: String,
    pub model: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub quota: i64,
    pub model_ratio: f64,
    pub group_ratio: f64,
}

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    /// Admission check. Denies when the cached balance cannot cover the
    /// estimate; performs no writes.
    pub async fn admit(&self, ctx: &RelayContext, estimate: i64) -> Result<(), RelayError> {
        if !ctx.consume_quota {
            return Ok(());
        }
        let cached = self
            .store
            .cache_get_user_quota(ctx.user_id)
            .await
            .map_err(|err| {
                RelayError::wrap(err, codes::GET_USER_QUOTA_FAILED, StatusCode::INTERNAL_SERVER_ERROR)
            })?;
        if cached - estimate < 0 {
            return Err(RelayError::forbidden(
                "user quota is not enough",
                codes::INSUFFICIENT_USER_QUOTA,
            ));
        }
        Ok(())
    }

    /// Commit the observed cost. Side-effect order: token decrement, cache
    /// refresh, consume log, user counters, channel counter. A zero charge
    /// skips the log and the counters.
    pub async fn commit(&self, charge: QuotaCharge) {
        if let Err(err) = self
            .store
            .post_consume_token_quota(charge.token_id, charge.quota)
            .await
        {
            error!(token_id = charge.token_id, error = %err, "failed to consume token quota");
        }
        if let Err(err) = self.store.cache_update_user_quota(charge.user_id).await {
            error!(user_id = charge.user_id, error = %err, "failed to refresh user quota cache");
        }
        if charge.quota == 0 {
            return;
        }
        let note = format!(
            "模型倍率 {:.2}，分组倍率 {:.2}",
            charge.model_ratio, charge.group_ratio
        );
        self.store
            .record_consume_log(ConsumeLogEntry {
                user_id: charge.user_id,
                channel_id: charge.channel_id,
                prompt_tokens: charge.prompt_tokens,
                completion_tokens: charge.completion_tokens,
                model: charge.model.clone(),
                token_name: charge.token_name.clone(),
                quota: charge.quota,
                note,
            })
            .await;
        self.store
            .update_user_used_quota_and_request_count(charge.user_id, charge.quota)
            .await;
        self.store
            .update_channel_used_quota(charge.channel_id, charge.quota)
            .await;
    }
}

#[derive(Default)]
struct MemoryQuotaState {
    user_quota: HashMap<i64, i64>,
    token_quota: HashMap<i64, i64>,
    user_used_quota: HashMap<i64, i64>,
    user_request_count: HashMap<i64, i64>,
    channel_used_quota: HashMap<i64, i64>,
    logs: Vec<ConsumeLogEntry>,
}

/// In-memory quota store. The cached user quota and the durable balance are
/// the same map, so cache refreshes are no-ops.
#[derive(Default)]
pub struct MemoryQuotaStore {
    state: Mutex<MemoryQuotaState>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_user_quota(&self, user_id: i64, quota: i64) {
        self.lock().user_quota.insert(user_id, quota);
    }

    pub fn set_token_quota(&self, token_id: i64, quota: i64) {
        self.lock().token_quota.insert(token_id, quota);
    }

    pub fn user_quota(&self, user_id: i64) -> i64 {
        self.lock().user_quota.get(&user_id).copied().unwrap_or(0)
    }

    pub fn token_quota(&self, token_id: i64) -> i64 {
        self.lock().token_quota.get(&token_id).copied().unwrap_or(0)
    }

    pub fn user_used_quota(&self, user_id: i64) -> i64 {
        self.lock().user_used_quota.get(&user_id).copied().unwrap_or(0)
    }

    pub fn user_request_count(&self, user_id: i64) -> i64 {
        self.lock().user_request_count.get(&user_id).copied().unwrap_or(0)
    }

    pub fn channel_used_quota(&self, channel_id: i64) -> i64 {
        self.lock().channel_used_quota.get(&channel_id).copied().unwrap_or(0)
    }

    pub fn consume_logs(&self) -> Vec<ConsumeLogEntry> {
        self.lock().logs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryQuotaState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn cache_get_user_quota(&self, user_id: i64) -> Result<i64, StoreError> {
        Ok(self.user_quota(user_id))
    }

    async fn post_consume_token_quota(&self, token_id: i64, delta: i64) -> Result<(), StoreError> {
        let mut state = self.lock();
        *state.token_quota.entry(token_id).or_insert(0) -= delta;
        Ok(())
    }

    // The durable balance and the cached balance are the same map here, so
    // the user decrement rides the counter update and the refresh is a no-op.

    async fn cache_update_user_quota(&self, _user_id: i64) -> Result<(), StoreError> {
        Ok(())
    }

    async fn update_user_used_quota_and_request_count(&self, user_id: i64, delta: i64) {
        let mut state = self.lock();
        *state.user_used_quota.entry(user_id).or_insert(0) += delta;
        *state.user_request_count.entry(user_id).or_insert(0) += 1;
        *state.user_quota.entry(user_id).or_insert(0) -= delta;
    }

    async fn update_channel_used_quota(&self, channel_id: i64, delta: i64) {
        *self.lock().channel_used_quota.entry(channel_id).or_insert(0) += delta;
    }

    async fn record_consume_log(&self, entry: ConsumeLogEntry) {
        self.lock().logs.push(entry);
    }
}
