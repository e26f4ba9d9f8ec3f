//! Bearer token issue / parse / validate / revoke
//!
//! Tokens are HS512-signed compact JWTs. The signature and time window are
//! checked locally; `validate` additionally requires the user's liveness
//! key in the cache so `revoke` invalidates every outstanding token at once.

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use common::TimeProvider;
use errors::{HeraldError, HeraldResult, TokenErrorKind};

use super::{liveness_key, Claims, TokenCache, UserIdentity};

const TOKEN_ALGORITHM: Algorithm = Algorithm::HS512;

/// `exp` has whole-second resolution and stays valid through its last
/// millisecond, so the liveness key outlives the issue instant by one more
/// second
const LIVENESS_GRACE_SECS: u64 = 1;

/// Result of [`TokenAuthenticator::issue`]
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    /// Lifetime in seconds
    pub expires_in: u64,
}

pub struct TokenAuthenticator {
    issuer: String,
    ttl_secs: u64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    cache: Arc<dyn TokenCache>,
    clock: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("issuer", &self.issuer)
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl TokenAuthenticator {
    /// `secret` overrides the key derived from the issuer name (`"Jwt:" + issuer`)
    pub fn new(
        issuer: impl Into<String>,
        secret: Option<&str>,
        ttl_secs: u64,
        cache: Arc<dyn TokenCache>,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        let issuer = issuer.into();
        let key = match secret {
            Some(secret) if !secret.is_empty() => secret.as_bytes().to_vec(),
            _ => format!("Jwt:{}", issuer).into_bytes(),
        };

        // Time bounds are checked against the injected clock instead
        let mut validation = Validation::new(TOKEN_ALGORITHM);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.required_spec_claims = HashSet::new();
        validation.set_issuer(&[issuer.as_str()]);

        Self {
            encoding_key: EncodingKey::from_secret(&key),
            decoding_key: DecodingKey::from_secret(&key),
            issuer,
            ttl_secs,
            validation,
            cache,
            clock,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Sign a token for `user` and mark the user live for the same TTL
    pub async fn issue(&self, user: &UserIdentity) -> HeraldResult<IssuedToken> {
        let now = self.clock.now_secs();
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        let claims = Claims {
            user_id: user.id,
            username: user.username.clone(),
            iat: now,
            nbf: now,
            exp: now.saturating_add(ttl),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::new(TOKEN_ALGORITHM), &claims, &self.encoding_key)
            .map_err(|e| HeraldError::Internal(format!("Failed to sign token: {}", e)))?;

        self.cache
            .set_ex(
                &liveness_key(&user.username),
                "1",
                self.ttl_secs.saturating_add(LIVENESS_GRACE_SECS),
            )
            .await?;

        debug!(username = %user.username, "Token issued");
        Ok(IssuedToken {
            token,
            expires_in: self.ttl_secs,
        })
    }

    /// Verify signature, issuer and time window. The cache is not consulted.
    pub fn parse(&self, token: &str) -> HeraldResult<Claims> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("Token rejected: {}", e);
                HeraldError::Token(classify(e.kind()))
            })?;

        let now = self.clock.now_secs();
        if now < claims.nbf {
            return Err(HeraldError::Token(TokenErrorKind::NotYetValid));
        }
        if now > claims.exp {
            return Err(HeraldError::Token(TokenErrorKind::Expired));
        }
        Ok(claims)
    }

    /// [`parse`](Self::parse) plus the cache liveness check
    pub async fn validate(&self, token: &str) -> HeraldResult<Claims> {
        let claims = self.parse(token)?;
        if !self.cache.exists(&liveness_key(&claims.username)).await? {
            return Err(HeraldError::Token(TokenErrorKind::Invalid));
        }
        Ok(claims)
    }

    /// Invalidate every outstanding token for `username`
    pub async fn revoke(&self, username: &str) -> HeraldResult<()> {
        let removed = self.cache.del(&liveness_key(username)).await?;
        debug!(username, removed, "Tokens revoked");
        Ok(())
    }
}

fn classify(kind: &ErrorKind) -> TokenErrorKind {
    match kind {
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => TokenErrorKind::Malformed,
        ErrorKind::ExpiredSignature => TokenErrorKind::Expired,
        ErrorKind::ImmatureSignature => TokenErrorKind::NotYetValid,
        _ => TokenErrorKind::Invalid,
    }
}
