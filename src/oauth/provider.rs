//! Provider configuration and authorization URL construction.

/// Token-issuing authority this deployment talks to.
///
/// Assembled once at startup from the `[provider]` config table plus the
/// client credential pair from the environment.
#[derive(Clone)]
pub struct ProviderConfig {
    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Fixed callback address registered with the provider
    pub redirect_uri: String,

    /// Fixed permission set requested on every authorization
    pub scopes: Vec<String>,

    /// Application client ID
    pub client_id: String,

    /// Application client secret
    pub client_secret: String,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl ProviderConfig {
    /// Space-delimited scope string as sent to the provider
    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    /// Build the redirect target that starts the authorization dance.
    ///
    /// `state` is passed through verbatim when present.
    pub fn build_auth_url(&self, state: Option<&str>) -> String {
        let separator = if self.auth_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{}response_type=code&client_id={}&scope={}&redirect_uri={}",
            self.auth_url,
            separator,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.scope()),
            urlencoding::encode(&self.redirect_uri),
        );

        if let Some(state) = state {
            url.push_str("&state=");
            url.push_str(&urlencoding::encode(state));
        }

        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProviderConfig {
        ProviderConfig {
            auth_url: "https://accounts.example.com/authorize".to_string(),
            token_url: "https://accounts.example.com/api/token".to_string(),
            redirect_uri: "http://localhost:8080/auth/callback".to_string(),
            scopes: vec!["streaming".to_string(), "user-read-email".to_string()],
            client_id: "test_client_id".to_string(),
            client_secret: "test_secret".to_string(),
        }
    }

    #[test]
    fn test_build_auth_url() {
        let url = test_config().build_auth_url(Some("random_state"));

        assert!(url.starts_with("https://accounts.example.com/authorize?response_type=code&"));
        assert!(url.contains("client_id=test_client_id"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fauth%2Fcallback"));
        // URL encoding converts spaces to %20
        assert!(url.contains("scope=streaming%20user-read-email"));
        assert!(url.ends_with("&state=random_state"));
        assert!(!url.contains("test_secret"));
    }

    #[test]
    fn test_build_auth_url_without_state() {
        let url = test_config().build_auth_url(None);
        assert!(!url.contains("state="));
    }

    #[test]
    fn test_build_auth_url_with_existing_query() {
        let mut config = test_config();
        config.auth_url = "https://accounts.example.com/authorize?show_dialog=true".to_string();

        let url = config.build_auth_url(None);
        assert!(url.starts_with("https://accounts.example.com/authorize?show_dialog=true&response_type=code"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", test_config());
        assert!(!debug.contains("test_secret"));
        assert!(debug.contains("<redacted>"));
    }
}
