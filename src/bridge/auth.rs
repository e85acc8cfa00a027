//! Gateway authentication
//!
//! Token issuance lives elsewhere; the gateway only checks the token sent
//! in the first frame of a connection.

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::ErrorCode;

/// Who a connection authenticated as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid token")]
    InvalidToken,

    #[error("Authentication timed out")]
    Timeout,

    #[error("First message must be auth, got {0}")]
    ExpectedAuth(String),

    #[error("Connection closed before authentication")]
    Closed,
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::Unauthenticated
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Fixed token -> user table from the config file
pub struct StaticTokenAuthenticator {
    /// SHA-256 of each token, so every comparison is over 32 bytes
    tokens: Vec<([u8; 32], String)>,
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.trim().as_bytes()).into()
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: &HashMap<String, String>) -> Self {
        Self {
            tokens: tokens
                .iter()
                .filter(|(token, _)| !token.trim().is_empty())
                .map(|(token, user)| (digest(token), user.clone()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let received = digest(token);
        // Compare against every entry so timing does not depend on position
        let mut matched: Option<&String> = None;
        for (expected, user) in &self.tokens {
            if bool::from(received[..].ct_eq(&expected[..])) {
                matched = Some(user);
            }
        }
        match matched {
            Some(user) => Ok(Identity { user: user.clone() }),
            None => {
                warn!("Gateway token authentication failed");
                Err(AuthError::InvalidToken)
            }
        }
    }
}
