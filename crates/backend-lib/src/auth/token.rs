// ============================
// crates/backend-lib/src/auth/token.rs
// ============================
//! Session tokens: HS512 JWTs with a revocation set in the store.
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::AppError;
use crate::metric_keys;
use crate::store::Store;
use parley_common::UserId;

const ISSUER: &str = "parley";

/// JWT claim set. `sub` carries the user id as a string; `jti` keys the
/// revocation set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

impl Claims {
    fn user_id(&self) -> Result<UserId, AppError> {
        self.sub
            .parse()
            .map_err(|_| AppError::Unauthenticated("token subject is not a user id".to_string()))
    }

    fn expires_at(&self) -> Result<DateTime<Utc>, AppError> {
        DateTime::<Utc>::from_timestamp(self.exp, 0)
            .ok_or_else(|| AppError::Unauthenticated("token expiry is out of range".to_string()))
    }
}

/// Issues, verifies, revokes and refreshes session tokens. Revocations
/// live in the store so every instance sees a logout immediately.
#[derive(Clone)]
pub struct TokenService<S> {
    store: S,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: u64,
    refresh_grace_secs: u64,
}

impl<S: Store + Clone> TokenService<S> {
    pub fn new(store: S, settings: &Settings) -> Self {
        Self {
            store,
            encoding_key: EncodingKey::from_secret(settings.signer_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(settings.signer_key.as_bytes()),
            ttl_secs: settings.token_ttl_secs,
            refresh_grace_secs: settings.refresh_grace_secs,
        }
    }

    /// Issue a fresh token for `user_id`.
    pub fn issue(&self, user_id: UserId) -> Result<String, AppError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            iss: ISSUER.to_string(),
            iat: now,
            exp: now + self.ttl_secs as i64,
            jti: Uuid::new_v4().to_string(),
        };
        let token = encode(&Header::new(Algorithm::HS512), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("token signing failed: {e}")))?;
        counter!(metric_keys::TOKEN_ISSUED).increment(1);
        debug!(user_id, "token issued");
        Ok(token)
    }

    /// Validate signature, issuer, expiry and revocation; return the
    /// subject user id.
    pub async fn verify(&self, token: &str) -> Result<UserId, AppError> {
        let claims = self.decode(token, 0)?;
        self.reject_revoked(&claims).await?;
        claims.user_id()
    }

    /// Revoke a valid token. The `jti` is remembered until the token
    /// would have expired anyway.
    pub async fn revoke(&self, token: &str) -> Result<(), AppError> {
        let claims = self.decode(token, 0)?;
        self.reject_revoked(&claims).await?;
        self.store
            .insert_revocation(&claims.jti, claims.expires_at()?)
            .await?;
        counter!(metric_keys::TOKEN_REVOKED).increment(1);
        info!(sub = %claims.sub, "token revoked");
        Ok(())
    }

    /// Exchange a token for a fresh one. The old token may already be
    /// expired, up to the configured grace window; it is revoked as a
    /// side effect so it cannot be replayed.
    pub async fn refresh(&self, token: &str) -> Result<String, AppError> {
        let claims = self.decode(token, self.refresh_grace_secs)?;
        self.reject_revoked(&claims).await?;
        let user_id = claims.user_id()?;
        self.store
            .insert_revocation(&claims.jti, claims.expires_at()?)
            .await?;
        self.issue(user_id)
    }

    fn decode(&self, token: &str, leeway_secs: u64) -> Result<Claims, AppError> {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.leeway = leeway_secs;
        validation.set_issuer(&[ISSUER]);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }

    async fn reject_revoked(&self, claims: &Claims) -> Result<(), AppError> {
        if self.store.is_revoked(&claims.jti).await? {
            return Err(AppError::Unauthenticated("token has been revoked".to_string()));
        }
        Ok(())
    }
}

/// Periodically drop revocation entries for tokens that have expired on
/// their own. Runs until the process exits.
pub fn spawn_revocation_purge<S: Store + Clone>(
    store: S,
    period: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // First tick fires immediately; skip it
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired_revocations(Utc::now()).await {
                Ok(purged) if purged > 0 => {
                    counter!(metric_keys::REVOCATIONS_PURGED).increment(purged as u64);
                    debug!(purged, "purged expired token revocations");
                },
                Ok(_) => {},
                Err(e) => warn!(error = %e, "revocation purge failed"),
            }
        }
    })
}
