//! Caller-facing HTTP surface.
//!
//! Implements the authorization code flow plus token retrieval:
//! 1. GET /auth/login?user_id=..     → Redirect to provider (with CSRF state)
//! 2. User authorizes on provider's site
//! 3. GET /auth/callback?code=&state= → Exchange code, store credentials
//! 4. GET /auth/token?user_id=..     → Usable access token, refreshed if stale
//!
//! Plus POST /auth/token/refresh (forced refresh) and GET /auth/status.

use crate::lifecycle::{LifecycleError, TokenLifecycleManager, TokenState};
use crate::oauth::{ExchangeError, ProviderConfig, StateManager};
use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};


/// Identity used when `/auth/login` is called without `user_id`
pub const DEFAULT_USER_IDENTITY: &str = "default";

const LOGIN_PATH: &str = "/auth/login";

/// Seconds a caller should wait before retrying a transient failure
const RETRY_AFTER_SECONDS: &str = "5";

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    /// Where to restart authorization, when that is the remedy
    #[serde(skip_serializing_if = "Option::is_none")]
    login: Option<String>,
}

/// Application error types for auth endpoints
#[derive(Debug)]
enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    ReauthorizationRequired { message: String, login: String },
    ServerError(String),
    BadGateway(String),
    ServiceUnavailable(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::ServiceUnavailable(msg) = self {
            let body = Json(ErrorResponse {
                error: msg,
                login: None,
            });
            let mut resp = (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
            resp.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(RETRY_AFTER_SECONDS),
            );
            return resp;
        }

        let (status, error, login) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::ReauthorizationRequired { message, login } => {
                (StatusCode::UNAUTHORIZED, message, Some(login))
            }
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg, None),
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, None),
        };

        (status, Json(ErrorResponse { error, login })).into_response()
    }
}

impl From<LifecycleError> for AppError {
    fn from(e: LifecycleError) -> Self {
        if e.is_retryable() {
            warn!(error = %e, "Token request failed transiently");
            return AppError::ServiceUnavailable(format!("{}, retry later", e));
        }

        match e {
            LifecycleError::NoCredential(user) => {
                AppError::NotFound(format!("No access token available for user '{}'", user))
            }
            LifecycleError::ReauthorizationRequired(user) => AppError::ReauthorizationRequired {
                message: format!("Reauthorization required for user '{}'", user),
                login: format!("{}?user_id={}", LOGIN_PATH, urlencoding::encode(&user)),
            },
            LifecycleError::Exchange(e @ ExchangeError::ProviderRejected { .. }) => {
                AppError::BadRequest(format!("Authorization failed: {}", e))
            }
            LifecycleError::Exchange(e @ ExchangeError::RefreshTokenInvalid(_)) => {
                AppError::BadRequest(format!("Authorization failed: {}", e))
            }
            LifecycleError::Exchange(e @ ExchangeError::MalformedResponse(_)) => {
                error!(error = %e, "Provider returned an unexpected response");
                AppError::BadGateway(e.to_string())
            }
            LifecycleError::Store(e) => {
                error!(error = %e, "Token store failure");
                AppError::ServerError("Internal server error".to_string())
            }
            LifecycleError::RefreshTransientFailure(msg)
            | LifecycleError::Exchange(ExchangeError::ProviderUnreachable(msg)) => {
                AppError::ServiceUnavailable(msg)
            }
        }
    }
}

/// Shared application state for auth API
#[derive(Clone)]
pub struct AuthAppState {
    pub lifecycle: Arc<TokenLifecycleManager>,
    pub provider: Arc<ProviderConfig>,
    pub state_manager: StateManager,
    pub post_authorize_redirect: Option<String>,
}

/// `user_id` query parameter
#[derive(Deserialize)]
pub struct UserQuery {
    user_id: Option<String>,
}

impl UserQuery {
    fn required(self) -> Result<String, AppError> {
        self.user_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::BadRequest("Invalid user_id".to_string()))
    }
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Successful authorization (when no post-authorize redirect is configured)
#[derive(Serialize)]
pub struct AuthorizedResponse {
    success: bool,
    user_id: String,
    expires_at: i64,
}

/// Usable access token. The refresh token never leaves the broker.
#[derive(Serialize)]
pub struct TokenResponse {
    user_id: String,
    access_token: String,
    expires_at: i64,
    scope: String,
}

/// Derived token state
#[derive(Serialize)]
pub struct StatusResponse {
    user_id: String,
    state: TokenState,
}

/// Create auth API router
pub fn create_auth_router(state: AuthAppState) -> Router {
    Router::new()
        .route("/auth/login", get(login))
        .route("/auth/callback", get(callback))
        .route("/auth/token", get(token))
        .route("/auth/token/refresh", post(refresh))
        .route("/auth/status", get(status))
        .with_state(Arc::new(state))
}

/// CORS policy letting a single browser origin call the token endpoints
pub fn cors_layer(origin: &str) -> anyhow::Result<CorsLayer> {
    let origin = HeaderValue::from_str(origin)
        .map_err(|e| anyhow::anyhow!("Invalid CORS origin '{}': {}", origin, e))?;

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST]))
}

/// GET /auth/login
///
/// Starts authorization by redirecting the user to the provider.
///
/// # Security
/// - Generates a single-use CSRF state bound to the user identity
async fn login(
    State(state): State<Arc<AuthAppState>>,
    Query(query): Query<UserQuery>,
) -> Redirect {
    let user_identity = query
        .user_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_USER_IDENTITY.to_string());

    let csrf_state = state.state_manager.create_state(&user_identity);
    let auth_url = state.provider.build_auth_url(Some(&csrf_state));

    info!(user_id = %user_identity, "Redirecting to OAuth provider");

    Redirect::to(&auth_url)
}

/// GET /auth/callback
///
/// Exchanges the authorization code and stores the credential under the
/// identity bound to `state`.
async fn callback(
    State(state): State<Arc<AuthAppState>>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Response, AppError> {
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "OAuth authorization failed");
        return Err(AppError::BadRequest(format!(
            "OAuth authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    let entry = state
        .state_manager
        .validate_and_consume(&csrf_state)
        .ok_or_else(|| {
            warn!("Invalid or expired OAuth state");
            AppError::Unauthorized(
                "Invalid or expired OAuth state (possible CSRF attack)".to_string(),
            )
        })?;

    debug!(user_id = %entry.user_identity, "CSRF state validated");

    let record = state
        .lifecycle
        .complete_authorization(&code, &entry.user_identity)
        .await?;

    if let Some(target) = &state.post_authorize_redirect {
        return Ok(Redirect::to(target).into_response());
    }

    Ok(Json(AuthorizedResponse {
        success: true,
        user_id: record.user_identity,
        expires_at: record.expires_at,
    })
    .into_response())
}

/// GET /auth/token
///
/// Returns a usable access token, running the refresh flow first if the
/// stored one has expired.
async fn token(
    State(state): State<Arc<AuthAppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<TokenResponse>, AppError> {
    let user_identity = query.required()?;

    let record = state
        .lifecycle
        .get_valid_credential(&user_identity)
        .await?;

    Ok(Json(TokenResponse {
        user_id: record.user_identity,
        access_token: record.access_token,
        expires_at: record.expires_at,
        scope: record.scope,
    }))
}

/// POST /auth/token/refresh
///
/// Refreshes regardless of the current token's expiry.
async fn refresh(
    State(state): State<Arc<AuthAppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<TokenResponse>, AppError> {
    let user_identity = query.required()?;

    let record = state.lifecycle.force_refresh(&user_identity).await?;

    Ok(Json(TokenResponse {
        user_id: record.user_identity,
        access_token: record.access_token,
        expires_at: record.expires_at,
        scope: record.scope,
    }))
}

/// GET /auth/status
async fn status(
    State(state): State<Arc<AuthAppState>>,
    Query(query): Query<UserQuery>,
) -> Result<Json<StatusResponse>, AppError> {
    let user_identity = query.required()?;

    let token_state = state.lifecycle.token_state(&user_identity)?;

    Ok(Json(StatusResponse {
        user_id: user_identity,
        state: token_state,
    }))
}
