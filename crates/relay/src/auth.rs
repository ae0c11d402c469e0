//! Token verification for relay connections.
//!
//! The identity provider and the persistent user/device database are
//! external; the relay consumes them through this store. Viewer principal
//! tokens are seeded by the embedding process, workstation credentials are
//! minted here (directly via `/devices` or through the pairing flow) and
//! live for the relay's lifetime.

use std::collections::HashMap;
use std::sync::Mutex;

use tether_protocol::new_id;

/// What a token is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRole {
    Viewer,
    Workstation,
}

/// The authenticated identity behind a connection.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user: String,
    pub role: TokenRole,
}

#[derive(Default)]
pub struct TokenStore {
    tokens: Mutex<HashMap<String, Principal>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a viewer principal token for a user.
    pub fn seed_viewer(&self, token: &str, user: &str) {
        let mut tokens = self.tokens.lock().expect("token lock");
        tokens.insert(
            token.to_string(),
            Principal {
                user: user.to_string(),
                role: TokenRole::Viewer,
            },
        );
    }

    /// Mint a long-lived workstation credential bound to a user.
    pub fn issue_workstation(&self, user: &str) -> String {
        let credential = new_id();
        let mut tokens = self.tokens.lock().expect("token lock");
        tokens.insert(
            credential.clone(),
            Principal {
                user: user.to_string(),
                role: TokenRole::Workstation,
            },
        );
        credential
    }

    pub fn verify(&self, token: &str) -> Option<Principal> {
        let tokens = self.tokens.lock().expect("token lock");
        tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_token_does_not_verify() {
        let store = TokenStore::new();
        assert!(store.verify("nope").is_none());
    }

    #[test]
    fn issued_workstation_credential_verifies_with_role() {
        let store = TokenStore::new();
        let credential = store.issue_workstation("robin");
        let principal = store.verify(&credential).unwrap();
        assert_eq!(principal.user, "robin");
        assert_eq!(principal.role, TokenRole::Workstation);
    }

    #[test]
    fn seeded_viewer_token_verifies() {
        let store = TokenStore::new();
        store.seed_viewer("tok-1", "robin");
        let principal = store.verify("tok-1").unwrap();
        assert_eq!(principal.role, TokenRole::Viewer);
    }
}
