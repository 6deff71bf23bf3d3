//! Business handler seam
//!
//! Tenant-specific work runs behind `EventHandler`, called from the
//! background task once the event has been claimed in the ledger and the
//! tenant's installation resolved.

use async_trait::async_trait;
use hg_common::{EventKey, Installation, Result};
use serde_json::Value;
use std::sync::Arc;

use crate::envelope::EnvelopeKind;
use crate::installation::InstallationStore;

#[derive(Clone)]
pub struct HandlerContext {
    pub key: EventKey,
    pub kind: EnvelopeKind,
    pub payload: Value,
    pub installation: Installation,
    /// Provider redelivery number, `None` on first delivery
    pub retry_attempt: Option<u32>,
    /// For explicit revocation by business code
    pub installations: Arc<InstallationStore>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Done,
    /// Deliver through the envelope's response URL, when it has one
    Reply(Value),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome>;
}

/// Handler that acknowledges everything and does nothing
pub struct NoopHandler;

#[async_trait]
impl EventHandler for NoopHandler {
    async fn handle(&self, _ctx: HandlerContext) -> Result<HandlerOutcome> {
        Ok(HandlerOutcome::Done)
    }
}
