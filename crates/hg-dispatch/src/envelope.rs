//! Provider envelopes
//!
//! Maps a verified body onto one of the inbound shapes:
//! - Events API callbacks, keyed by `team_id` + `event_id`
//! - the `url_verification` handshake
//! - slash commands and interactive payloads, keyed by `team_id` + `trigger_id`
//!
//! Retry headers describe redeliveries of the same logical event.

use hg_common::{EventId, EventKey, HookgateError, InboundRequest, Result, TenantId};
use reqwest::Url;
use serde_json::Value;
use std::fmt;

pub const RETRY_NUM_HEADER: &str = "x-slack-retry-num";
pub const RETRY_REASON_HEADER: &str = "x-slack-retry-reason";

const APP_UNINSTALLED: &str = "app_uninstalled";
const TOKENS_REVOKED: &str = "tokens_revoked";

/// Single-use callback URL for delivering a deferred result
#[derive(Clone, PartialEq, Eq)]
pub struct PendingResponse(String);

impl PendingResponse {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn url(&self) -> &str {
        &self.0
    }

    pub fn host(&self) -> Option<String> {
        Url::parse(&self.0)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}

// The path is an unguessable capability; only the host is ever printed.
impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host() {
            Some(host) => write!(f, "PendingResponse({}/…)", host),
            None => f.write_str("PendingResponse(<invalid>)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeKind {
    Event { event_type: String },
    SlashCommand { command: String },
    Interaction { interaction_type: String },
}

impl EnvelopeKind {
    pub fn label(&self) -> &str {
        match self {
            EnvelopeKind::Event { event_type } => event_type.as_str(),
            EnvelopeKind::SlashCommand { command } => command.as_str(),
            EnvelopeKind::Interaction { interaction_type } => interaction_type.as_str(),
        }
    }
}

/// An envelope that is deduplicated and processed in the background
#[derive(Debug, Clone)]
pub struct Dispatchable {
    pub key: EventKey,
    pub kind: EnvelopeKind,
    pub response_url: Option<PendingResponse>,
    pub payload: Value,
}

impl Dispatchable {
    pub fn tenant_id(&self) -> &TenantId {
        &self.key.tenant_id
    }

    /// Events revoking the tenant's installation. `tokens_revoked` only counts
    /// when it names bot tokens; user (`oauth`) revocations leave the bot installed.
    pub fn is_uninstall(&self) -> bool {
        match &self.kind {
            EnvelopeKind::Event { event_type } if event_type == APP_UNINSTALLED => true,
            EnvelopeKind::Event { event_type } if event_type == TOKENS_REVOKED => self
                .payload
                .pointer("/tokens/bot")
                .and_then(Value::as_array)
                .is_some_and(|bots| !bots.is_empty()),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Envelope {
    UrlVerification { challenge: String },
    Dispatch(Dispatchable),
}

impl Envelope {
    pub fn parse(body: &Value) -> Result<Envelope> {
        let object = body
            .as_object()
            .ok_or_else(|| HookgateError::InvalidPayload("body is not an object".to_string()))?;

        if let Some(kind) = object.get("type").and_then(Value::as_str) {
            match kind {
                "url_verification" => {
                    let challenge = required_str(body, "challenge")?;
                    return Ok(Envelope::UrlVerification { challenge });
                }
                "event_callback" => return Self::parse_event(body).map(Envelope::Dispatch),
                _ => {}
            }
        }

        if object.contains_key("command") {
            return Self::parse_command(body).map(Envelope::Dispatch);
        }

        if let Some(payload) = object.get("payload").filter(|p| p.is_object()) {
            return Self::parse_interaction(payload).map(Envelope::Dispatch);
        }

        Err(HookgateError::InvalidPayload(
            "unrecognized envelope".to_string(),
        ))
    }

    fn parse_event(body: &Value) -> Result<Dispatchable> {
        let tenant_id = required_str(body, "team_id")?;
        let event_id = required_str(body, "event_id")?;
        let event_type = body
            .pointer("/event/type")
            .and_then(Value::as_str)
            .ok_or_else(|| HookgateError::InvalidPayload("missing event.type".to_string()))?;

        Ok(Dispatchable {
            key: EventKey::new(TenantId::new(tenant_id), EventId::new(event_id)),
            kind: EnvelopeKind::Event {
                event_type: event_type.to_string(),
            },
            response_url: None,
            payload: body.get("event").cloned().unwrap_or(Value::Null),
        })
    }

    fn parse_command(body: &Value) -> Result<Dispatchable> {
        let tenant_id = required_str(body, "team_id")?;
        let trigger_id = required_str(body, "trigger_id")?;
        let command = required_str(body, "command")?;

        Ok(Dispatchable {
            key: EventKey::new(TenantId::new(tenant_id), EventId::new(trigger_id)),
            kind: EnvelopeKind::SlashCommand { command },
            response_url: optional_str(body, "/response_url").map(PendingResponse::new),
            payload: body.clone(),
        })
    }

    fn parse_interaction(payload: &Value) -> Result<Dispatchable> {
        let tenant_id = optional_str(payload, "/team/id")
            .ok_or_else(|| HookgateError::InvalidPayload("missing team.id".to_string()))?;
        let trigger_id = required_str(payload, "trigger_id")?;
        let interaction_type = optional_str(payload, "/type").unwrap_or_else(|| "interaction".to_string());

        // View submissions carry their callback URLs in a list
        let response_url = optional_str(payload, "/response_url")
            .or_else(|| optional_str(payload, "/response_urls/0/response_url"))
            .map(PendingResponse::new);

        Ok(Dispatchable {
            key: EventKey::new(TenantId::new(tenant_id), EventId::new(trigger_id)),
            kind: EnvelopeKind::Interaction { interaction_type },
            response_url,
            payload: payload.clone(),
        })
    }
}

fn required_str(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| HookgateError::InvalidPayload(format!("missing {}", field)))
}

fn optional_str(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Redelivery metadata from the provider's retry headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryInfo {
    pub attempt: u32,
    pub reason: Option<String>,
}

impl RetryInfo {
    pub fn from_request(request: &InboundRequest) -> Option<Self> {
        let attempt = request.header(RETRY_NUM_HEADER)?.trim().parse::<u32>().ok()?;
        Some(Self {
            attempt,
            reason: request.header(RETRY_REASON_HEADER).map(str::to_string),
        })
    }
}
