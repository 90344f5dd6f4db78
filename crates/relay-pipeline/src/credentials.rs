//! Upstream credential lookup.

use std::collections::HashMap;

use secrecy::SecretString;

/// Credentials resolved from configuration, keyed by the name a route's
/// `credential` field references. Values are wrapped in [`SecretString`] so
/// debug and log output never carries them.
#[derive(Debug, Default)]
pub struct CredentialStore {
    entries: HashMap<String, SecretString>,
}

impl CredentialStore {
    /// Wraps the already-resolved credential map from the configuration.
    /// Environment references are expanded before this point, at load time.
    #[must_use]
    pub fn from_config(credentials: &HashMap<String, String>) -> Self {
        let entries = credentials
            .iter()
            .map(|(name, value)| (name.clone(), SecretString::new(value.clone())))
            .collect();
        Self { entries }
    }

    /// Returns the secret registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SecretString> {
        self.entries.get(name)
    }

    /// Number of registered credentials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no credentials are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use secrecy::ExposeSecret;

    #[test]
    fn lookup_exposes_only_on_request() {
        let mut raw = HashMap::new();
        raw.insert("openai".to_owned(), "Bearer sk-live-123".to_owned());
        let store = CredentialStore::from_config(&raw);

        assert_eq!(store.len(), 1);
        let secret = store.get("openai").unwrap();
        assert_eq!(secret.expose_secret(), "Bearer sk-live-123");
        assert!(store.get("anthropic").is_none());
    }

    #[test]
    fn debug_output_redacts_values() {
        let mut raw = HashMap::new();
        raw.insert("pay".to_owned(), "sk-live-456".to_owned());
        let store = CredentialStore::from_config(&raw);

        let rendered = format!("{store:?}");
        assert!(rendered.contains("pay"));
        assert!(!rendered.contains("sk-live-456"));
    }
}
