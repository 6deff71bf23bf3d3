//! Dispatch Coordinator
//!
//! Per request: `Received -> Verified -> Deduplicated -> Acknowledged`, then
//! `Processed | Failed` in a background task.
//!
//! The acknowledgment path awaits only the ledger claim, bounded by the ack
//! budget. Everything tenant-specific (installation lookup, business logic,
//! delayed responses) happens in `BackgroundTask::run` on the worker pool.

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use hg_common::{EventKey, HookgateError, InboundRequest, Installation, TenantId};
use hg_config::DispatchConfig;
use serde_json::{json, Value};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::delayed_response::DelayedResponder;
use crate::envelope::{Dispatchable, Envelope, RetryInfo};
use crate::handler::{EventHandler, HandlerContext, HandlerOutcome};
use crate::installation::InstallationStore;
use crate::ledger::{BeginOutcome, Claim, IdempotencyLedger};
use crate::pool::WorkerPool;
use crate::signature::{SignatureVerifier, VerificationResult};

/// Synchronous answer to the provider
#[derive(Debug, Clone, PartialEq)]
pub enum AckResponse {
    /// 200 with an empty body
    Accepted,
    /// 200 answering the url_verification handshake
    Challenge(String),
    /// 401
    Unauthorized { reason: &'static str },
    /// 400
    BadRequest { message: String },
    /// 429
    TooManyRequests { retry_after_secs: u64 },
    /// 503; the provider's retry will be treated as fresh
    Unavailable { message: String },
}

impl AckResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            AckResponse::Accepted | AckResponse::Challenge(_) => 200,
            AckResponse::Unauthorized { .. } => 401,
            AckResponse::BadRequest { .. } => 400,
            AckResponse::TooManyRequests { .. } => 429,
            AckResponse::Unavailable { .. } => 503,
        }
    }

    pub fn body(&self) -> Value {
        match self {
            AckResponse::Accepted => json!({}),
            AckResponse::Challenge(challenge) => json!({ "challenge": challenge }),
            AckResponse::Unauthorized { reason } => {
                json!({ "error": "UNAUTHORIZED", "message": reason })
            }
            AckResponse::BadRequest { message } => {
                json!({ "error": "BAD_REQUEST", "message": message })
            }
            AckResponse::TooManyRequests { retry_after_secs } => json!({
                "error": "TOO_MANY_REQUESTS",
                "message": "redelivery rate exceeded",
                "retry_after_secs": retry_after_secs,
            }),
            AckResponse::Unavailable { message } => {
                json!({ "error": "SERVICE_UNAVAILABLE", "message": message })
            }
        }
    }

    fn outcome_label(&self) -> &'static str {
        match self {
            AckResponse::Accepted => "accepted",
            AckResponse::Challenge(_) => "challenge",
            AckResponse::Unauthorized { .. } => "unauthorized",
            AckResponse::BadRequest { .. } => "bad_request",
            AckResponse::TooManyRequests { .. } => "rate_limited",
            AckResponse::Unavailable { .. } => "unavailable",
        }
    }
}

/// How a background task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Completed,
    /// Ledger completed with the error flag
    Failed,
    /// Ledger released for a later retry
    Released,
    TimedOut,
    /// Claim lapsed while queued; the task never started
    Expired,
}

impl TaskResult {
    fn label(&self) -> &'static str {
        match self {
            TaskResult::Completed => "completed",
            TaskResult::Failed => "failed",
            TaskResult::Released => "released",
            TaskResult::TimedOut => "timed_out",
            TaskResult::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Upper bound on the ledger claim in the acknowledgment path
    pub ack_budget: Duration,
    /// Self-imposed limit on a background task, measured from the ledger
    /// claim. Normally the processing TTL.
    pub task_deadline: Duration,
    pub task_retry_attempts: u32,
    pub task_retry_backoff: Duration,
    /// Redeliveries per tenant per minute before answering 429; 0 disables
    pub retry_limit_per_minute: u32,
}

impl DispatchSettings {
    pub fn from_config(config: &DispatchConfig, task_deadline: Duration) -> Self {
        Self {
            ack_budget: config.ack_budget(),
            task_deadline,
            task_retry_attempts: config.task_retry_attempts.max(1),
            task_retry_backoff: config.task_retry_backoff(),
            retry_limit_per_minute: config.retry_limit_per_minute,
        }
    }
}

/// Collaborators shared by the coordinator and its tasks
#[derive(Clone)]
pub struct Collaborators {
    pub verifier: Arc<SignatureVerifier>,
    pub ledger: Arc<IdempotencyLedger>,
    pub installations: Arc<InstallationStore>,
    pub handler: Arc<dyn EventHandler>,
    pub responder: Arc<DelayedResponder>,
    pub pool: Arc<WorkerPool>,
}

type RetryLimiter = RateLimiter<TenantId, DefaultKeyedStateStore<TenantId>, DefaultClock>;

/// Per-tenant limit on provider redeliveries
struct RetryGuard {
    limiter: Option<RetryLimiter>,
    clock: DefaultClock,
}

impl RetryGuard {
    fn new(per_minute: u32) -> Self {
        Self {
            limiter: NonZeroU32::new(per_minute).map(|n| RateLimiter::keyed(Quota::per_minute(n))),
            clock: DefaultClock::default(),
        }
    }

    /// `Err(seconds to wait)` when the tenant exceeded its quota
    fn check(&self, tenant_id: &TenantId) -> Result<(), u64> {
        match &self.limiter {
            Some(limiter) => limiter.check_key(tenant_id).map_err(|not_until| {
                not_until.wait_time_from(self.clock.now()).as_secs().max(1)
            }),
            None => Ok(()),
        }
    }
}

pub struct DispatchCoordinator {
    parts: Collaborators,
    settings: DispatchSettings,
    retry_guard: RetryGuard,
}

impl DispatchCoordinator {
    pub fn new(parts: Collaborators, settings: DispatchSettings) -> Self {
        let retry_guard = RetryGuard::new(settings.retry_limit_per_minute);
        Self {
            parts,
            settings,
            retry_guard,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.parts.pool
    }

    pub fn installations(&self) -> &Arc<InstallationStore> {
        &self.parts.installations
    }

    /// Handle a request and hand any background task to the worker pool
    pub async fn dispatch(&self, request: &InboundRequest) -> AckResponse {
        let (ack, task) = self.handle(request).await;
        let Some(task) = task else {
            return ack;
        };

        let claim = task.claim.clone();
        let key = claim.key().clone();
        match self.parts.pool.submit(async move {
            task.run().await;
        }) {
            Ok(()) => ack,
            Err(e) => {
                let err = HookgateError::from(e);
                warn!(event = %key, error = %err, "Background task not admitted, releasing ledger entry");
                if let Err(release_err) = self.parts.ledger.release(&claim).await {
                    error!(event = %key, error = %release_err, "Failed to release ledger entry");
                }
                metrics::counter!("hookgate_requests_total", "outcome" => "pool_full").increment(1);
                AckResponse::Unavailable {
                    message: "worker pool unavailable".to_string(),
                }
            }
        }
    }

    /// Verify, deduplicate and acknowledge. The returned task is not started.
    pub async fn handle(&self, request: &InboundRequest) -> (AckResponse, Option<BackgroundTask>) {
        let started = Instant::now();
        let (ack, task) = self.acknowledge(request).await;

        metrics::histogram!("hookgate_ack_latency_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("hookgate_requests_total", "outcome" => ack.outcome_label()).increment(1);

        (ack, task)
    }

    async fn acknowledge(&self, request: &InboundRequest) -> (AckResponse, Option<BackgroundTask>) {
        let body = match self.parts.verifier.verify(request) {
            VerificationResult::Valid(body) => body,
            failure => {
                let reason = failure.label();
                if let Some(err) = failure.into_error() {
                    warn!(error = %err, "Rejected request failing verification");
                }
                return (AckResponse::Unauthorized { reason }, None);
            }
        };

        let dispatchable = match Envelope::parse(&body) {
            Ok(Envelope::UrlVerification { challenge }) => {
                info!("Answered url_verification handshake");
                return (AckResponse::Challenge(challenge), None);
            }
            Ok(Envelope::Dispatch(dispatchable)) => dispatchable,
            Err(e) => {
                warn!(error = %e, "Verified request with unrecognized envelope");
                return (
                    AckResponse::BadRequest {
                        message: e.to_string(),
                    },
                    None,
                );
            }
        };

        let retry = RetryInfo::from_request(request);
        if let Some(ref retry) = retry {
            info!(
                event = %dispatchable.key,
                retry_num = retry.attempt,
                retry_reason = ?retry.reason,
                "Provider redelivery"
            );
            if let Err(retry_after_secs) = self.retry_guard.check(dispatchable.tenant_id()) {
                warn!(tenant_id = %dispatchable.tenant_id(), "Redelivery rate exceeded");
                return (AckResponse::TooManyRequests { retry_after_secs }, None);
            }
        }

        let key = dispatchable.key.clone();
        let begin = tokio::time::timeout(self.settings.ack_budget, self.parts.ledger.begin(&key)).await;

        match begin {
            Ok(Ok(BeginOutcome::Proceed(claim))) => {
                debug!(event = %key, kind = dispatchable.kind.label(), "Event claimed");
                let task = BackgroundTask {
                    dispatchable,
                    claim,
                    retry_attempt: retry.map(|r| r.attempt),
                    parts: self.parts.clone(),
                    settings: self.settings.clone(),
                };
                (AckResponse::Accepted, Some(task))
            }
            Ok(Ok(outcome)) => {
                info!(event = %key, outcome = ?outcome, "Duplicate delivery acknowledged");
                (AckResponse::Accepted, None)
            }
            Ok(Err(e)) => {
                error!(event = %key, error = %e, "Ledger unavailable, failing closed");
                (
                    AckResponse::Unavailable {
                        message: "idempotency ledger unavailable".to_string(),
                    },
                    None,
                )
            }
            Err(_) => {
                error!(
                    event = %key,
                    budget_ms = self.settings.ack_budget.as_millis() as u64,
                    "Ledger claim exceeded ack budget, failing closed"
                );
                (
                    AckResponse::Unavailable {
                        message: "idempotency ledger timed out".to_string(),
                    },
                    None,
                )
            }
        }
    }
}

/// Work for one claimed event. Owns the ledger entry until it settles.
pub struct BackgroundTask {
    dispatchable: Dispatchable,
    claim: Claim,
    retry_attempt: Option<u32>,
    parts: Collaborators,
    settings: DispatchSettings,
}

impl BackgroundTask {
    pub fn key(&self) -> &EventKey {
        &self.dispatchable.key
    }

    pub fn dispatchable(&self) -> &Dispatchable {
        &self.dispatchable
    }

    pub fn claim(&self) -> &Claim {
        &self.claim
    }

    /// Time left before the claim may lapse, keeping a tenth of the deadline
    /// as margin for settling the ledger entry
    fn remaining_budget(&self) -> Option<Duration> {
        let deadline = self.settings.task_deadline;
        let budget = deadline.saturating_sub(deadline / 10);
        budget
            .checked_sub(self.claim.claimed_at().elapsed())
            .filter(|remaining| !remaining.is_zero())
    }

    /// Execute within what is left of the task deadline and settle the ledger entry
    pub async fn run(self) -> TaskResult {
        let started = Instant::now();
        let Some(remaining) = self.remaining_budget() else {
            warn!(
                event = %self.key(),
                queued_ms = self.claim.claimed_at().elapsed().as_millis() as u64,
                "Ledger claim lapsed while queued, skipping event"
            );
            self.release().await;
            metrics::counter!("hookgate_tasks_total", "result" => TaskResult::Expired.label()).increment(1);
            return TaskResult::Expired;
        };

        let outcome = tokio::time::timeout(remaining, self.execute()).await;
        let result = match outcome {
            Ok(outcome) => self.settle(outcome).await,
            Err(_) => {
                warn!(
                    event = %self.key(),
                    deadline_ms = remaining.as_millis() as u64,
                    "Background task exceeded its deadline, releasing ledger entry"
                );
                self.release().await;
                TaskResult::TimedOut
            }
        };

        metrics::counter!("hookgate_tasks_total", "result" => result.label()).increment(1);
        debug!(
            event = %self.key(),
            result = result.label(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Background task finished"
        );
        result
    }

    async fn execute(&self) -> Result<HandlerOutcome, HookgateError> {
        let tenant_id = self.dispatchable.tenant_id();

        if self.dispatchable.is_uninstall() {
            let removed = self
                .with_retries("uninstall", || self.parts.installations.delete(tenant_id))
                .await?;
            info!(tenant_id = %tenant_id, removed, "Installation revoked by provider event");
            return Ok(HandlerOutcome::Done);
        }

        let installation: Installation = self
            .with_retries("installation lookup", || self.parts.installations.get(tenant_id))
            .await?;

        let ctx = HandlerContext {
            key: self.dispatchable.key.clone(),
            kind: self.dispatchable.kind.clone(),
            payload: self.dispatchable.payload.clone(),
            installation,
            retry_attempt: self.retry_attempt,
            installations: self.parts.installations.clone(),
        };

        self.with_retries("handler", || self.parts.handler.handle(ctx.clone()))
            .await
    }

    /// Retry transient failures with exponential backoff
    async fn with_retries<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, HookgateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HookgateError>>,
    {
        let max_attempts = self.settings.task_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(HookgateError::Transient(message)) if attempt < max_attempts => {
                    let delay = self.settings.task_retry_backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        event = %self.key(),
                        operation,
                        attempt,
                        error = %message,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn settle(&self, outcome: Result<HandlerOutcome, HookgateError>) -> TaskResult {
        match outcome {
            Ok(HandlerOutcome::Done) => self.complete().await,
            Ok(HandlerOutcome::Reply(payload)) => {
                self.reply(&payload).await;
                self.complete().await
            }
            Err(HookgateError::InstallationNotFound(tenant_id)) => {
                warn!(
                    event = %self.key(),
                    tenant_id = %tenant_id,
                    "No installation for tenant, skipping event"
                );
                self.complete_with_error().await
            }
            Err(e) if e.is_retryable() => {
                warn!(event = %self.key(), error = %e, "Background task failed, releasing for retry");
                self.release().await;
                TaskResult::Released
            }
            Err(e) => {
                error!(event = %self.key(), error = %e, "Background task failed permanently");
                self.reply(&json!({
                    "response_type": "ephemeral",
                    "text": "Sorry, that request could not be completed.",
                }))
                .await;
                self.complete_with_error().await
            }
        }
    }

    async fn reply(&self, payload: &Value) {
        if let Some(ref pending) = self.dispatchable.response_url {
            let outcome = self.parts.responder.deliver(pending, payload).await;
            debug!(event = %self.key(), outcome = outcome.label(), "Delayed response finished");
        }
    }

    async fn complete(&self) -> TaskResult {
        if let Err(e) = self.parts.ledger.complete(&self.claim).await {
            error!(event = %self.key(), error = %e, "Failed to mark ledger entry completed");
        }
        TaskResult::Completed
    }

    async fn complete_with_error(&self) -> TaskResult {
        if let Err(e) = self.parts.ledger.complete_with_error(&self.claim).await {
            error!(event = %self.key(), error = %e, "Failed to mark ledger entry failed");
        }
        TaskResult::Failed
    }

    async fn release(&self) {
        if let Err(e) = self.parts.ledger.release(&self.claim).await {
            error!(event = %self.key(), error = %e, "Failed to release ledger entry; it expires with its TTL");
        }
    }
}
