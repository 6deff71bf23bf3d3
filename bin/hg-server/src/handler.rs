//! Built-in business handler

use async_trait::async_trait;
use hg_common::Result;
use hg_dispatch::{EnvelopeKind, EventHandler, HandlerContext, HandlerOutcome};
use serde_json::{json, Value};
use tracing::info;

/// Echoes slash command text back to the caller; logs everything else
pub struct SlashCommandEcho;

#[async_trait]
impl EventHandler for SlashCommandEcho {
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome> {
        match &ctx.kind {
            EnvelopeKind::SlashCommand { command } => {
                let text = ctx.payload.get("text").and_then(Value::as_str).unwrap_or_default();
                info!(tenant_id = %ctx.key.tenant_id, command = %command, "Echoing slash command");
                Ok(HandlerOutcome::Reply(json!({
                    "response_type": "ephemeral",
                    "text": format!("You said: {}", text),
                })))
            }
            kind => {
                info!(
                    tenant_id = %ctx.key.tenant_id,
                    kind = kind.label(),
                    retry = ?ctx.retry_attempt,
                    "Event processed"
                );
                Ok(HandlerOutcome::Done)
            }
        }
    }
}
