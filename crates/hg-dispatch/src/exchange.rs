//! Credential Exchange
//!
//! Install flow:
//! 1. `issue_state` stores a short-lived anti-forgery token
//! 2. the tenant approves at the provider's authorize URL
//! 3. `exchange` consumes the token (single use), trades the code for a bot
//!    credential at the token endpoint and upserts the Installation
//!
//! Nothing is written to the Installation Store unless every step succeeds.

use chrono::Utc;
use hg_common::{Installation, SecretString, TenantId};
use hg_config::{OAuthConfig, SlackConfig};
use hg_store::KvStore;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::installation::InstallationStore;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Invalid, expired or already used state token")]
    InvalidState,

    #[error("Redirect URI does not match the one the flow started with")]
    RedirectMismatch,

    #[error("Missing authorization code")]
    MissingCode,

    #[error("Token endpoint request failed: {0}")]
    Http(String),

    #[error("Provider rejected the exchange: {0}")]
    Provider(String),

    #[error("Malformed token response: {0}")]
    MalformedResponse(String),

    #[error("Storage error: {0}")]
    Store(String),

    #[error("OAuth is not configured")]
    NotConfigured,
}

/// Where the authorization flow returns to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectContext {
    pub state: String,
    pub redirect_uri: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub token_url: String,
    pub authorize_url: String,
    pub redirect_uri: Option<String>,
    pub scopes: String,
    pub state_ttl: Duration,
    pub request_timeout: Duration,
}

impl ExchangeConfig {
    /// `None` unless client credentials are configured
    pub fn from_config(slack: &SlackConfig, oauth: &OAuthConfig) -> Option<Self> {
        Some(Self {
            client_id: slack.client_id.clone()?,
            client_secret: slack.client_secret.clone()?,
            token_url: slack.token_url.clone(),
            authorize_url: slack.authorize_url.clone(),
            redirect_uri: slack.redirect_uri.clone(),
            scopes: slack.scopes.clone(),
            state_ttl: oauth.state_ttl(),
            request_timeout: Duration::from_secs(30),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenTeam {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

/// `oauth.v2.access` response body
#[derive(Debug, Deserialize)]
struct TokenResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    bot_user_id: Option<String>,
    #[serde(default)]
    app_id: Option<String>,
    #[serde(default)]
    team: Option<TokenTeam>,
}

pub struct CredentialExchange {
    config: ExchangeConfig,
    client: reqwest::Client,
    states: Arc<dyn KvStore>,
    installations: Arc<InstallationStore>,
}

impl CredentialExchange {
    pub fn new(
        config: ExchangeConfig,
        states: Arc<dyn KvStore>,
        installations: Arc<InstallationStore>,
    ) -> Result<Self, ExchangeError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ExchangeError::Http(e.to_string()))?;

        Ok(Self {
            config,
            client,
            states,
            installations,
        })
    }

    fn state_key(state: &str) -> String {
        format!("hookgate:oauth_state:{}", state)
    }

    /// Issue a fresh state token bound to the configured redirect URI
    pub async fn issue_state(&self) -> Result<String, ExchangeError> {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let state = hex::encode(bytes);
        let redirect = self.config.redirect_uri.clone().unwrap_or_default();

        self.states
            .put(&Self::state_key(&state), &redirect, self.config.state_ttl)
            .await
            .map_err(|e| ExchangeError::Store(e.to_string()))?;

        debug!("Issued OAuth state token");
        Ok(state)
    }

    /// Provider authorize URL carrying `state`
    pub fn authorize_url(&self, state: &str) -> String {
        let mut url = format!(
            "{}?client_id={}&scope={}&state={}",
            self.config.authorize_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.scopes),
            urlencoding::encode(state),
        );
        if let Some(ref redirect) = self.config.redirect_uri {
            url.push_str(&format!("&redirect_uri={}", urlencoding::encode(redirect)));
        }
        url
    }

    /// Trade an authorization code for a bot credential and persist it
    pub async fn exchange(
        &self,
        code: &str,
        context: &RedirectContext,
    ) -> Result<Installation, ExchangeError> {
        // Consumed before anything else so a token is never usable twice
        let issued_redirect = self
            .states
            .take(&Self::state_key(&context.state))
            .await
            .map_err(|e| ExchangeError::Store(e.to_string()))?
            .ok_or_else(|| {
                warn!("Rejected OAuth callback with unknown or reused state");
                ExchangeError::InvalidState
            })?;

        let redirect_uri = match (&context.redirect_uri, issued_redirect.is_empty()) {
            (Some(given), false) if *given != issued_redirect => {
                return Err(ExchangeError::RedirectMismatch)
            }
            (Some(given), _) => Some(given.clone()),
            (None, false) => Some(issued_redirect),
            (None, true) => None,
        };

        if code.trim().is_empty() {
            return Err(ExchangeError::MissingCode);
        }

        let response = self.request_token(code, redirect_uri.as_deref()).await?;
        let fresh = Self::to_installation(response)?;

        self.installations
            .upsert(&fresh)
            .await
            .map_err(|e| ExchangeError::Store(e.to_string()))?;

        // Reinstalls keep the first installed_at; report the record as stored
        let installation = self
            .installations
            .get(&fresh.tenant_id)
            .await
            .map_err(|e| ExchangeError::Store(e.to_string()))?;

        info!(
            tenant_id = %installation.tenant_id,
            scopes = %installation.scope_string(),
            "Installation stored"
        );
        Ok(installation)
    }

    async fn request_token(
        &self,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> Result<TokenResponse, ExchangeError> {
        let mut params = vec![
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
        ];
        if let Some(redirect) = redirect_uri {
            params.push(("redirect_uri", redirect));
        }

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ExchangeError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExchangeError::Http(format!("token endpoint returned {}", status)));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;

        if !body.ok {
            let reason = body.error.unwrap_or_else(|| "unknown_error".to_string());
            warn!(error = %reason, "Token exchange rejected by provider");
            return Err(ExchangeError::Provider(reason));
        }

        Ok(body)
    }

    fn to_installation(response: TokenResponse) -> Result<Installation, ExchangeError> {
        let token = response
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ExchangeError::MalformedResponse("missing access_token".to_string()))?;
        let team = response
            .team
            .ok_or_else(|| ExchangeError::MalformedResponse("missing team".to_string()))?;

        let now = Utc::now();
        Ok(Installation {
            tenant_id: TenantId::new(team.id),
            team_name: team.name,
            bot_token: SecretString::new(token),
            bot_user_id: response.bot_user_id,
            app_id: response.app_id,
            scopes: Installation::parse_scopes(response.scope.as_deref().unwrap_or_default()),
            installed_at: now,
            updated_at: now,
        })
    }
}
