//! Idempotency Ledger
//!
//! Per-event processing state kept in the key-value collaborator:
//! - `processing:{owner}`: short TTL; bounds how long a crashed worker blocks retries
//! - `completed` / `completed:failed`: long TTL; suppresses replays
//! - absent: never seen, expired, or released
//!
//! `begin` relies solely on the store's atomic insert-if-absent, so callers
//! racing on one key get a single `Proceed`. The winner receives a `Claim`
//! whose owner token fences `complete` and `release`: once a claim has
//! lapsed and been taken over, its holder can no longer touch the entry.

use hg_common::EventKey;
use hg_store::{KvStore, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const PROCESSING: &str = "processing";
const PROCESSING_PREFIX: &str = "processing:";
const COMPLETED: &str = "completed";
const COMPLETED_FAILED: &str = "completed:failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    Processing,
    Completed { failed: bool },
}

impl LedgerState {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            COMPLETED => Some(LedgerState::Completed { failed: false }),
            COMPLETED_FAILED => Some(LedgerState::Completed { failed: true }),
            PROCESSING => Some(LedgerState::Processing),
            _ if raw.starts_with(PROCESSING_PREFIX) => Some(LedgerState::Processing),
            _ => None,
        }
    }
}

/// Ownership of a `Processing` entry, handed out by a successful `begin`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    key: EventKey,
    token: String,
    claimed_at: Instant,
}

impl Claim {
    fn new(key: EventKey) -> Self {
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self {
            key,
            token: hex::encode(bytes),
            claimed_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &EventKey {
        &self.key
    }

    /// Taken just before the insert, so never later than the entry's TTL start
    pub fn claimed_at(&self) -> Instant {
        self.claimed_at
    }

    fn entry_value(&self) -> String {
        format!("{}{}", PROCESSING_PREFIX, self.token)
    }
}

/// Result of claiming an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// Caller owns the event and must eventually complete or release the claim
    Proceed(Claim),
    AlreadyHandled,
    InProgress,
}

impl BeginOutcome {
    pub fn is_proceed(&self) -> bool {
        matches!(self, BeginOutcome::Proceed(_))
    }
}

pub struct IdempotencyLedger {
    store: Arc<dyn KvStore>,
    processing_ttl: Duration,
    completed_ttl: Duration,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn KvStore>, processing_ttl: Duration, completed_ttl: Duration) -> Self {
        Self {
            store,
            processing_ttl,
            completed_ttl,
        }
    }

    pub fn processing_ttl(&self) -> Duration {
        self.processing_ttl
    }

    pub async fn begin(&self, key: &EventKey) -> Result<BeginOutcome> {
        let storage_key = key.storage_key();

        // Second pass covers an entry expiring between the failed insert and the read
        for _ in 0..2 {
            let claim = Claim::new(key.clone());
            if self
                .store
                .put_if_absent(&storage_key, &claim.entry_value(), self.processing_ttl)
                .await?
            {
                debug!(event = %key, "Ledger entry claimed");
                return Ok(BeginOutcome::Proceed(claim));
            }

            match self.store.get(&storage_key).await? {
                Some(raw) => {
                    return Ok(match LedgerState::parse(&raw) {
                        Some(LedgerState::Completed { .. }) => BeginOutcome::AlreadyHandled,
                        Some(LedgerState::Processing) => BeginOutcome::InProgress,
                        None => {
                            warn!(event = %key, "Unrecognized ledger entry, treating as in progress");
                            BeginOutcome::InProgress
                        }
                    });
                }
                None => continue,
            }
        }

        Ok(BeginOutcome::InProgress)
    }

    /// Mark a claimed event as successfully handled
    pub async fn complete(&self, claim: &Claim) -> Result<()> {
        self.finish(claim, COMPLETED).await
    }

    /// Mark a claimed event as permanently failed so redeliveries are not re-attempted
    pub async fn complete_with_error(&self, claim: &Claim) -> Result<()> {
        self.finish(claim, COMPLETED_FAILED).await
    }

    /// Give up a claim so the next delivery is treated as fresh.
    /// A claim that already lapsed leaves any newer owner's entry alone.
    pub async fn release(&self, claim: &Claim) -> Result<()> {
        let removed = self
            .store
            .delete_if_eq(&claim.key.storage_key(), &claim.entry_value())
            .await?;
        if removed {
            debug!(event = %claim.key, "Ledger entry released");
        } else {
            debug!(event = %claim.key, "Ledger claim already lapsed, nothing to release");
        }
        Ok(())
    }

    /// Current state, `None` when absent
    pub async fn state(&self, key: &EventKey) -> Result<Option<LedgerState>> {
        let raw = self.store.get(&key.storage_key()).await?;
        Ok(raw.as_deref().and_then(LedgerState::parse))
    }

    async fn finish(&self, claim: &Claim, completed: &str) -> Result<()> {
        let storage_key = claim.key.storage_key();

        if self
            .store
            .compare_and_swap(&storage_key, &claim.entry_value(), completed, self.completed_ttl)
            .await?
        {
            return Ok(());
        }

        // The claim lapsed. Record the outcome only while nobody else holds the key.
        if self
            .store
            .put_if_absent(&storage_key, completed, self.completed_ttl)
            .await?
        {
            warn!(
                event = %claim.key,
                "Ledger entry missing on completion, processing outlived its TTL"
            );
        } else {
            warn!(
                event = %claim.key,
                "Ledger claim was taken over by a later delivery, leaving its entry"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hg_common::{EventId, TenantId};
    use hg_store::MemoryKvStore;

    fn ledger() -> IdempotencyLedger {
        IdempotencyLedger::new(
            Arc::new(MemoryKvStore::new()),
            Duration::from_secs(120),
            Duration::from_secs(7200),
        )
    }

    fn short_ledger() -> IdempotencyLedger {
        IdempotencyLedger::new(
            Arc::new(MemoryKvStore::new()),
            Duration::from_millis(20),
            Duration::from_secs(60),
        )
    }

    fn key(tenant: &str, event: &str) -> EventKey {
        EventKey::new(TenantId::new(tenant), EventId::new(event))
    }

    fn proceed(outcome: BeginOutcome) -> Claim {
        match outcome {
            BeginOutcome::Proceed(claim) => claim,
            other => panic!("expected Proceed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_begin_then_duplicate() {
        let ledger = ledger();
        let k = key("T1", "E1");

        let claim = proceed(ledger.begin(&k).await.unwrap());
        assert_eq!(ledger.begin(&k).await.unwrap(), BeginOutcome::InProgress);
        assert_eq!(ledger.state(&k).await.unwrap(), Some(LedgerState::Processing));

        ledger.complete(&claim).await.unwrap();
        assert_eq!(ledger.begin(&k).await.unwrap(), BeginOutcome::AlreadyHandled);
        assert_eq!(
            ledger.state(&k).await.unwrap(),
            Some(LedgerState::Completed { failed: false })
        );
    }

    #[tokio::test]
    async fn test_release_allows_retry() {
        let ledger = ledger();
        let k = key("T1", "E1");

        let claim = proceed(ledger.begin(&k).await.unwrap());
        ledger.release(&claim).await.unwrap();
        assert_eq!(ledger.state(&k).await.unwrap(), None);
        assert!(ledger.begin(&k).await.unwrap().is_proceed());
    }

    #[tokio::test]
    async fn test_complete_with_error_suppresses_retry() {
        let ledger = ledger();
        let k = key("T1", "E1");

        let claim = proceed(ledger.begin(&k).await.unwrap());
        ledger.complete_with_error(&claim).await.unwrap();
        assert_eq!(ledger.begin(&k).await.unwrap(), BeginOutcome::AlreadyHandled);
        assert_eq!(
            ledger.state(&k).await.unwrap(),
            Some(LedgerState::Completed { failed: true })
        );
    }

    #[tokio::test]
    async fn test_lapsed_claim_still_records_completion() {
        let ledger = short_ledger();
        let k = key("T1", "E-expired");

        let claim = proceed(ledger.begin(&k).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ledger.state(&k).await.unwrap(), None);

        ledger.complete(&claim).await.unwrap();
        assert_eq!(ledger.begin(&k).await.unwrap(), BeginOutcome::AlreadyHandled);
    }

    #[tokio::test]
    async fn test_processing_entry_expires() {
        let ledger = short_ledger();
        let k = key("T1", "E1");

        assert!(ledger.begin(&k).await.unwrap().is_proceed());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ledger.begin(&k).await.unwrap().is_proceed());
    }

    #[tokio::test]
    async fn test_lapsed_owner_cannot_release_newer_claim() {
        let ledger = short_ledger();
        let k = key("T1", "E1");

        let stale = proceed(ledger.begin(&k).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = proceed(ledger.begin(&k).await.unwrap());
        assert_ne!(stale, current);

        ledger.release(&stale).await.unwrap();
        assert_eq!(ledger.state(&k).await.unwrap(), Some(LedgerState::Processing));
        assert_eq!(ledger.begin(&k).await.unwrap(), BeginOutcome::InProgress);

        ledger.release(&current).await.unwrap();
        assert_eq!(ledger.state(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lapsed_owner_cannot_complete_over_newer_claim() {
        let ledger = short_ledger();
        let k = key("T1", "E1");

        let stale = proceed(ledger.begin(&k).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = proceed(ledger.begin(&k).await.unwrap());

        ledger.complete_with_error(&stale).await.unwrap();
        assert_eq!(ledger.state(&k).await.unwrap(), Some(LedgerState::Processing));

        ledger.complete(&current).await.unwrap();
        assert_eq!(
            ledger.state(&k).await.unwrap(),
            Some(LedgerState::Completed { failed: false })
        );
    }

    #[tokio::test]
    async fn test_keys_are_tenant_scoped() {
        let ledger = ledger();
        assert!(ledger.begin(&key("T1", "E1")).await.unwrap().is_proceed());
        assert!(ledger.begin(&key("T2", "E1")).await.unwrap().is_proceed());
    }

    #[tokio::test]
    async fn test_concurrent_begin_single_proceed() {
        let ledger = Arc::new(ledger());
        let k = key("T1", "E1");

        let (a, b) = tokio::join!(ledger.begin(&k), ledger.begin(&k));
        let outcomes = [a.unwrap(), b.unwrap()];
        let proceeds = outcomes.iter().filter(|o| o.is_proceed()).count();
        assert_eq!(proceeds, 1);
        assert!(outcomes.contains(&BeginOutcome::InProgress));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            let k = key("T1", "E2");
            handles.push(tokio::spawn(async move { ledger.begin(&k).await.unwrap() }));
        }
        let mut proceeds = 0;
        for handle in handles {
            if handle.await.unwrap().is_proceed() {
                proceeds += 1;
            }
        }
        assert_eq!(proceeds, 1);
    }
}
