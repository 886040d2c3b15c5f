//! Credential verification seam.
//!
//! Token issuance lives elsewhere; the collaboration core only needs a
//! stable user id for a credential.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::CollabError;
use crate::model::UserId;

pub trait Authenticator: Send + Sync {
    /// Resolve a credential to a user, or fail with `CollabError::Authentication`.
    fn verify(&self, credential: &str) -> Result<UserId, CollabError>;
}

/// Fixed token → user table.
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    tokens: RwLock<HashMap<String, UserId>>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: impl IntoIterator<Item = (String, UserId)>) -> Self {
        Self {
            tokens: RwLock::new(tokens.into_iter().collect()),
        }
    }

    pub fn insert(&self, token: impl Into<String>, user_id: UserId) {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.into(), user_id);
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn verify(&self, credential: &str) -> Result<UserId, CollabError> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(credential)
            .copied()
            .ok_or_else(|| CollabError::Authentication("unknown token".into()))
    }
}
