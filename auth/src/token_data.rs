use serde::Deserialize;
use serde::Serialize;

/// OAuth2 refresh wiring stored alongside a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub refresh_url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// The stored credential for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: f64,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_config: Option<RefreshConfig>,
}

impl TokenData {
    pub fn is_expired(&self, now_unix: f64) -> bool {
        now_unix > self.expires_at
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Non-secret metadata cached in memory for quick status checks.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenMetadata {
    pub expires_at: f64,
    pub scopes: Vec<String>,
    pub has_refresh_token: bool,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn expiry_and_scopes() {
        let token = TokenData {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_at: 1000.0,
            scopes: vec!["read".to_string()],
            refresh_config: None,
        };
        assert!(!token.is_expired(999.0));
        assert!(token.is_expired(1001.0));
        assert!(token.has_scope("read"));
        assert!(!token.has_scope("write"));
    }
}
