//! Multi-tenant authentication store.
//!
//! Tokens are keyed by a `service` identifier. The preferred backend is
//! the OS keychain; the fallback is per-service encrypted files under
//! `{USER_SPACE}/.ai/auth/`, encrypted with AES-256-GCM under a key
//! derived via PBKDF2-HMAC-SHA256 from a machine-specific seed and a
//! per-install random salt.

mod store;
mod token_data;

pub use store::AuthStore;
pub use token_data::RefreshConfig;
pub use token_data::TokenData;
pub use token_data::TokenMetadata;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(Error, Debug)]
pub enum AuthError {
    /// Token missing, or expired without refresh material. Surfaced to the
    /// caller; never retried internally.
    #[error("authentication required for {service}: {message}")]
    AuthenticationRequired { service: String, message: String },

    /// The OAuth2 refresh endpoint rejected the refresh. Carries the
    /// server's status and body.
    #[error("token refresh failed for {service}: {status} {body}")]
    Refresh {
        service: String,
        status: u16,
        body: String,
    },

    #[error("auth storage unavailable: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
