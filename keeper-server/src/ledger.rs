//! Delivery deduplication.
//!
//! GitHub redelivers webhooks on timeouts and on manual retries. Each
//! delivery id is claimed before any work starts; a claim is either
//! completed (later deliveries are dropped) or released after a failure
//! (the next delivery may try again).

use std::time::Duration;

use moka::future::Cache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimState {
    InProgress,
    Completed,
}

/// Result of trying to claim a delivery id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// The caller owns the delivery and must complete or release it.
    Claimed,
    /// Another task is processing the same delivery right now.
    InProgress,
    /// The delivery was already processed.
    Completed,
}

#[derive(Clone)]
pub struct DeliveryLedger {
    claims: Cache<String, ClaimState>,
}

impl DeliveryLedger {
    /// Claims are forgotten after `ttl`; redeliveries older than that are
    /// processed again, which is harmless because passes converge.
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            claims: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn try_claim(&self, delivery_id: &str) -> ClaimResult {
        let entry = self
            .claims
            .entry(delivery_id.to_string())
            .or_insert(ClaimState::InProgress)
            .await;
        if entry.is_fresh() {
            return ClaimResult::Claimed;
        }
        match entry.into_value() {
            ClaimState::InProgress => ClaimResult::InProgress,
            ClaimState::Completed => ClaimResult::Completed,
        }
    }

    pub async fn complete(&self, delivery_id: &str) {
        self.claims
            .insert(delivery_id.to_string(), ClaimState::Completed)
            .await;
    }

    pub async fn release(&self, delivery_id: &str) {
        self.claims.invalidate(delivery_id).await;
    }
}

impl Default for DeliveryLedger {
    fn default() -> Self {
        Self::new(100_000, Duration::from_secs(30 * 60))
    }
}
