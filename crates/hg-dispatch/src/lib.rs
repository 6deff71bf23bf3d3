//! Hookgate Dispatch
//!
//! The webhook trust-and-dispatch core:
//! - `SignatureVerifier`: HMAC authenticity and freshness checks
//! - `IdempotencyLedger`: at-most-once claims per tenant-scoped event
//! - `InstallationStore`: cache-aside access to tenant credentials
//! - `DispatchCoordinator`: fast acknowledgment plus background execution
//! - `DelayedResponder`: deferred results through single-use response URLs
//! - `CredentialExchange`: OAuth code-for-token exchange during install

pub mod coordinator;
pub mod delayed_response;
pub mod envelope;
pub mod exchange;
pub mod handler;
pub mod installation;
pub mod ledger;
pub mod pool;
pub mod signature;

pub use coordinator::{
    AckResponse, BackgroundTask, Collaborators, DispatchCoordinator, DispatchSettings, TaskResult,
};
pub use delayed_response::{DelayedResponder, DeliveryError, DeliveryOutcome, ResponderConfig};
pub use envelope::{Dispatchable, Envelope, EnvelopeKind, PendingResponse, RetryInfo};
pub use exchange::{CredentialExchange, ExchangeConfig, ExchangeError, RedirectContext};
pub use handler::{EventHandler, HandlerContext, HandlerOutcome, NoopHandler};
pub use installation::InstallationStore;
pub use ledger::{BeginOutcome, Claim, IdempotencyLedger, LedgerState};
pub use pool::{PoolError, PoolStats, WorkerPool};
pub use signature::{compute_signature, SignatureVerifier, VerificationResult};
