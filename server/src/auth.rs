//! Connection authentication.
//!
//! Token issuance lives outside this crate; the server only verifies.

use std::collections::HashMap;

use shared::UserId;

/// Resolves an auth token to a user id.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<UserId>;
}

/// Fixed token table, for deployments where tokens are provisioned up front.
pub struct TokenAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl TokenAuthenticator {
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self { tokens }
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<UserId> {
        self.tokens.get(token).copied()
    }
}

/// Development-only authenticator accepting `dev-<id>` tokens.
pub struct DevAuthenticator;

impl Authenticator for DevAuthenticator {
    fn authenticate(&self, token: &str) -> Option<UserId> {
        token.strip_prefix("dev-")?.parse().ok()
    }
}
