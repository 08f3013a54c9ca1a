// =============================================================================
// Secrets — exchange credential lookup behind a trait seam
// =============================================================================
//
// main.rs currently reads BINANCE_API_KEY/BINANCE_API_SECRET straight out of
// the environment. Wrapping that behind a trait means a future secrets
// manager integration only needs a new impl, not call-site changes.
// =============================================================================

/// A source of exchange API credentials.
pub trait SecretsProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn require(&self, key: &str) -> Result<String, crate::error::CoreError> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| crate::error::CoreError::fatal(format!("missing required secret: {key}")))
    }
}

/// Reads secrets from process environment variables, the same source
/// `dotenv::dotenv()` populates at startup.
pub struct EnvSecretsProvider;

impl SecretsProvider for EnvSecretsProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSecrets(std::collections::HashMap<&'static str, &'static str>);

    impl SecretsProvider for FakeSecrets {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key).map(|v| v.to_string())
        }
    }

    #[test]
    fn require_errors_on_missing_key() {
        let secrets = FakeSecrets(std::collections::HashMap::new());
        assert!(secrets.require("BINANCE_API_KEY").is_err());
    }

    #[test]
    fn require_errors_on_empty_value() {
        let mut map = std::collections::HashMap::new();
        map.insert("BINANCE_API_KEY", "");
        let secrets = FakeSecrets(map);
        assert!(secrets.require("BINANCE_API_KEY").is_err());
    }

    #[test]
    fn require_returns_present_value() {
        let mut map = std::collections::HashMap::new();
        map.insert("BINANCE_API_KEY", "abc123");
        let secrets = FakeSecrets(map);
        assert_eq!(secrets.require("BINANCE_API_KEY").unwrap(), "abc123");
    }
}
