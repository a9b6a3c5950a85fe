//! OAuth token exchange logic.
//!
//! Trades an authorization code or a refresh token for a fresh token set at
//! the provider's token endpoint. The exchange never touches the token store.

use super::ProviderConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Normalized token endpoint response (standard OAuth 2.0)
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ProviderTokenResponse {
    pub access_token: String,
    /// Always `Bearer`; validated on parse
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    /// Lifetime in seconds, relative to issuance
    pub expires_in: u64,
    /// `None` means "keep using the previous refresh token"
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// OAuth error body (RFC 6749 section 5.2)
#[derive(Deserialize, Debug)]
struct ProviderErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchange failure classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// Provider declined the request (bad or expired code, bad client)
    ProviderRejected { status: u16, message: String },
    /// Network failure, timeout, or provider-side outage
    ProviderUnreachable(String),
    /// Response body did not match the expected schema
    MalformedResponse(String),
    /// Provider reports the refresh token as revoked or expired
    RefreshTokenInvalid(String),
}

impl ExchangeError {
    /// Whether retrying the same exchange later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::ProviderUnreachable(_))
    }
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeError::ProviderRejected { status, message } => {
                write!(f, "Provider rejected the exchange ({}): {}", status, message)
            }
            ExchangeError::ProviderUnreachable(msg) => write!(f, "Provider unreachable: {}", msg),
            ExchangeError::MalformedResponse(msg) => {
                write!(f, "Malformed provider response: {}", msg)
            }
            ExchangeError::RefreshTokenInvalid(msg) => {
                write!(f, "Refresh token is no longer valid: {}", msg)
            }
        }
    }
}

impl std::error::Error for ExchangeError {}

/// Provider-facing token exchanges.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Trade a one-time authorization code for an initial token set.
    async fn exchange_code(&self, code: &str) -> Result<ProviderTokenResponse, ExchangeError>;

    /// Trade a refresh token for a new access token.
    async fn exchange_refresh(
        &self,
        refresh_token: &str,
    ) -> Result<ProviderTokenResponse, ExchangeError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    fn as_str(self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

/// [`ExchangeClient`] that POSTs form-encoded grants to the provider's token
/// endpoint, authenticating the application with HTTP Basic credentials.
#[derive(Clone)]
pub struct HttpExchangeClient {
    client: reqwest::Client,
    provider: Arc<ProviderConfig>,
}

impl HttpExchangeClient {
    /// Create a client whose every request is bounded by `timeout`
    pub fn new(provider: Arc<ProviderConfig>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, provider })
    }

    async fn post_grant(
        &self,
        grant: GrantType,
        form: &[(&str, &str)],
    ) -> Result<ProviderTokenResponse, ExchangeError> {
        tracing::debug!(
            grant_type = grant.as_str(),
            token_url = %self.provider.token_url,
            "Sending token exchange request"
        );

        let response = self
            .client
            .post(&self.provider.token_url)
            .basic_auth(&self.provider.client_id, Some(&self.provider.client_secret))
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(grant, status, &body));
        }

        let body = response.bytes().await.map_err(transport_error)?;
        let token_response = parse_token_response(&body)?;

        tracing::debug!(
            grant_type = grant.as_str(),
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = token_response.expires_in,
            "Token exchange successful"
        );

        Ok(token_response)
    }
}

#[async_trait]
impl ExchangeClient for HttpExchangeClient {
    async fn exchange_code(&self, code: &str) -> Result<ProviderTokenResponse, ExchangeError> {
        let grant = GrantType::AuthorizationCode;
        self.post_grant(
            grant,
            &[
                ("grant_type", grant.as_str()),
                ("code", code),
                ("redirect_uri", self.provider.redirect_uri.as_str()),
            ],
        )
        .await
    }

    async fn exchange_refresh(
        &self,
        refresh_token: &str,
    ) -> Result<ProviderTokenResponse, ExchangeError> {
        let grant = GrantType::RefreshToken;
        self.post_grant(
            grant,
            &[
                ("grant_type", grant.as_str()),
                ("refresh_token", refresh_token),
            ],
        )
        .await
    }
}

fn transport_error(e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::ProviderUnreachable("request timed out".to_string())
    } else {
        ExchangeError::ProviderUnreachable(e.to_string())
    }
}

/// Map a non-2xx token endpoint response onto the error taxonomy.
fn classify_failure(grant: GrantType, status: StatusCode, body: &str) -> ExchangeError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return ExchangeError::ProviderUnreachable(format!("provider returned {}", status));
    }

    let (error, message) = match serde_json::from_str::<ProviderErrorBody>(body) {
        Ok(parsed) => {
            let message = match parsed.error_description {
                Some(description) => format!("{}: {}", parsed.error, description),
                None => parsed.error.clone(),
            };
            (Some(parsed.error), message)
        }
        Err(_) if body.is_empty() => (None, "empty response body".to_string()),
        Err(_) => (None, body.to_string()),
    };

    if grant == GrantType::RefreshToken && error.as_deref() == Some("invalid_grant") {
        return ExchangeError::RefreshTokenInvalid(message);
    }

    ExchangeError::ProviderRejected {
        status: status.as_u16(),
        message,
    }
}

/// Parse and validate a successful token endpoint body.
fn parse_token_response(body: &[u8]) -> Result<ProviderTokenResponse, ExchangeError> {
    let mut parsed: ProviderTokenResponse = serde_json::from_slice(body)
        .map_err(|e| ExchangeError::MalformedResponse(e.to_string()))?;

    if !parsed.token_type.eq_ignore_ascii_case("bearer") {
        return Err(ExchangeError::MalformedResponse(format!(
            "unexpected token_type '{}'",
            parsed.token_type
        )));
    }
    if parsed.access_token.is_empty() {
        return Err(ExchangeError::MalformedResponse(
            "empty access_token".to_string(),
        ));
    }

    parsed.refresh_token = parsed.refresh_token.filter(|token| !token.is_empty());
    Ok(parsed)
}
