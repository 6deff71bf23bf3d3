//! Delayed Response Channel
//!
//! Posts a deferred result to the single-use response URL bundled with the
//! original request. Delivery is best effort: bounded attempts with
//! exponential backoff, outcome reported through logs and metrics only.

use hg_config::DelayedResponseConfig;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::envelope::PendingResponse;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Responder configuration
#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Hosts a response URL may point at; empty allows any
    pub allowed_hosts: Vec<String>,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            allowed_hosts: vec!["hooks.slack.com".to_string()],
        }
    }
}

impl From<&DelayedResponseConfig> for ResponderConfig {
    fn from(config: &DelayedResponseConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            request_timeout: config.request_timeout(),
            allowed_hosts: config.allowed_hosts.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// Terminal 4xx from the receiver
    Rejected { status: u16, attempts: u32 },
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last_error: String },
    /// Not attempted: the URL is malformed or its host not allowed
    Refused { reason: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered { .. } => "delivered",
            DeliveryOutcome::Rejected { .. } => "rejected",
            DeliveryOutcome::Exhausted { .. } => "exhausted",
            DeliveryOutcome::Refused { .. } => "refused",
        }
    }
}

/// Classification of a single attempt's HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptStatus {
    Success,
    Retryable,
    Terminal,
}

impl AttemptStatus {
    fn from_code(code: u16) -> Self {
        match code {
            200..=299 => AttemptStatus::Success,
            429 | 500..=599 => AttemptStatus::Retryable,
            _ => AttemptStatus::Terminal,
        }
    }
}

pub struct DelayedResponder {
    config: ResponderConfig,
    client: reqwest::Client,
}

impl DelayedResponder {
    pub fn new(config: ResponderConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { config, client })
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.config.allowed_hosts.is_empty()
            || self
                .config
                .allowed_hosts
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(host))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.initial_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// POST `payload` to the pending response URL
    pub async fn deliver(&self, pending: &PendingResponse, payload: &Value) -> DeliveryOutcome {
        let outcome = self.attempt_delivery(pending, payload).await;
        metrics::counter!("hookgate_delayed_responses_total", "outcome" => outcome.label())
            .increment(1);
        outcome
    }

    async fn attempt_delivery(&self, pending: &PendingResponse, payload: &Value) -> DeliveryOutcome {
        let Some(host) = pending.host() else {
            warn!("Refusing delayed response to malformed URL");
            return DeliveryOutcome::Refused {
                reason: "malformed response URL".to_string(),
            };
        };
        if !self.host_allowed(&host) {
            warn!(host = %host, "Refusing delayed response to host outside allow-list");
            return DeliveryOutcome::Refused {
                reason: format!("host {} not allowed", host),
            };
        }

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.backoff(attempt - 1)).await;
            }

            match self.client.post(pending.url()).json(payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    match AttemptStatus::from_code(status.as_u16()) {
                        AttemptStatus::Success => {
                            info!(host = %host, attempts = attempt, "Delayed response delivered");
                            return DeliveryOutcome::Delivered { attempts: attempt };
                        }
                        AttemptStatus::Terminal => {
                            warn!(host = %host, status = status.as_u16(), "Delayed response rejected");
                            return DeliveryOutcome::Rejected {
                                status: status.as_u16(),
                                attempts: attempt,
                            };
                        }
                        AttemptStatus::Retryable => {
                            debug!(host = %host, status = status.as_u16(), attempt, "Delayed response attempt failed");
                            last_error = format!("HTTP {}", status);
                        }
                    }
                }
                Err(e) => {
                    debug!(host = %host, attempt, error = %e, "Delayed response request failed");
                    last_error = e.to_string();
                }
            }
        }

        warn!(
            host = %host,
            attempts = self.config.max_attempts,
            error = %last_error,
            "Delayed response attempts exhausted"
        );
        DeliveryOutcome::Exhausted {
            attempts: self.config.max_attempts,
            last_error,
        }
    }
}
