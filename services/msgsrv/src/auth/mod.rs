pub mod cache;
pub mod middleware;
pub mod password;
pub mod token;

use serde::{Deserialize, Serialize};

pub use cache::{MemoryTokenCache, RedisTokenCache, TokenCache};
pub use token::{IssuedToken, TokenAuthenticator};

/// Signed token payload
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: u64,
    pub username: String,
    pub iat: i64, // Issued at (seconds since epoch)
    pub nbf: i64, // Not before
    pub exp: i64, // Expires at
    pub iss: String,
}

/// The user a token is issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: u64,
    pub username: String,
}

/// Authenticated `(id, username)` extracted from a valid token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: u64,
    pub username: String,
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.user_id,
            username: claims.username,
        }
    }
}

/// Cache key marking a user's tokens as live
pub fn liveness_key(username: &str) -> String {
    format!("auth:{}", username)
}
