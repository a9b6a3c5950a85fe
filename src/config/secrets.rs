use anyhow::{Context, Result};

pub const CLIENT_ID_VAR: &str = "TOKENBROKER_CLIENT_ID";
pub const CLIENT_SECRET_VAR: &str = "TOKENBROKER_CLIENT_SECRET";
pub const ENCRYPTION_KEY_VAR: &str = "TOKENBROKER_ENCRYPTION_KEY";

/// Credentials that never live in the config file.
#[derive(Clone)]
pub struct Secrets {
    pub client_id: String,
    pub client_secret: String,
    /// Base64-encoded 32-byte master key for the token store
    pub encryption_key: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("encryption_key", &"<redacted>")
            .finish()
    }
}

impl Secrets {
    /// Read all secrets from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read all secrets through `lookup`. Empty values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .with_context(|| format!("{} is required", name))
        };

        Ok(Self {
            client_id: require(CLIENT_ID_VAR)?,
            client_secret: require(CLIENT_SECRET_VAR)?,
            encryption_key: require(ENCRYPTION_KEY_VAR)
                .context("Token store needs a base64-encoded 32-byte key")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_all_secrets_present() {
        let secrets = Secrets::from_lookup(lookup_from(&[
            (CLIENT_ID_VAR, "client"),
            (CLIENT_SECRET_VAR, "shh"),
            (ENCRYPTION_KEY_VAR, "a2V5"),
        ]))
        .unwrap();

        assert_eq!(secrets.client_id, "client");
        assert_eq!(secrets.client_secret, "shh");
        assert!(!format!("{:?}", secrets).contains("shh"));
    }

    #[test]
    fn test_missing_secret_is_named() {
        let err = Secrets::from_lookup(lookup_from(&[(CLIENT_ID_VAR, "client")])).unwrap_err();
        assert!(err.to_string().contains(CLIENT_SECRET_VAR));
    }

    #[test]
    fn test_blank_secret_is_missing() {
        let result = Secrets::from_lookup(lookup_from(&[
            (CLIENT_ID_VAR, "  "),
            (CLIENT_SECRET_VAR, "shh"),
            (ENCRYPTION_KEY_VAR, "a2V5"),
        ]));
        assert!(result.is_err());
    }
}
