//! Provider-facing half of the OAuth 2.0 authorization code flow.
//!
//! 1. [`ProviderConfig::build_auth_url`] produces the redirect that starts
//!    authorization, carrying a [`StateManager`] token for CSRF protection
//! 2. The provider sends the user back with `code` and the echoed `state`
//! 3. [`ExchangeClient::exchange_code`] trades the code for tokens
//! 4. [`ExchangeClient::exchange_refresh`] later mints new access tokens

mod exchange;
mod provider;
mod state_manager;

pub use exchange::{ExchangeClient, ExchangeError, HttpExchangeClient, ProviderTokenResponse};
pub use provider::ProviderConfig;
pub use state_manager::{run_state_cleanup, StateEntry, StateManager};
