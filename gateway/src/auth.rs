//! C2 — JWT Verifier: signature validation, claims extraction, optional
//! JWKS refresh (`spec.md` §4.2).
//!
//! The HMAC path mirrors the teacher's `OidcValidator` (`jsonwebtoken`
//! `Validation` with `validate_exp`, issuer/audience checks) almost
//! directly. The JWKS path is new: the teacher only fetches secrets
//! synchronously at boot (`auth.rs::AuthConfig::from_vault`), but this
//! gateway's JWKS refresh runs on the request path and must not block a
//! worker thread, so it uses async `reqwest` behind a single-flight guard.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gateway_config::JwtConfig;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub username: Option<String>,
    pub roles: Vec<String>,
    pub persona_id: Option<String>,
    pub exp: i64,
    pub iat: Option<i64>,
    pub iss: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    roles: Option<RolesField>,
    #[serde(default)]
    persona_id: Option<String>,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    iss: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RolesField {
    List(Vec<String>),
    SpaceSeparated(String),
}

impl From<RawClaims> for Claims {
    fn from(raw: RawClaims) -> Self {
        let roles = match raw.roles {
            Some(RolesField::List(list)) => list,
            Some(RolesField::SpaceSeparated(s)) => {
                s.split_whitespace().map(|r| r.to_string()).collect()
            }
            None => Vec::new(),
        };
        Claims {
            sub: raw.sub,
            username: raw.username,
            roles,
            persona_id: raw.persona_id,
            exp: raw.exp,
            iat: raw.iat,
            iss: raw.iss,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization header")]
    Missing,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("expired")]
    Expired,
    #[error("bad_signature")]
    BadSignature,
    #[error("bad_issuer")]
    BadIssuer,
    #[error("no key found for key id {0}")]
    UnknownKeyId(String),
}

impl AuthError {
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing_token",
            AuthError::Malformed(_) => "malformed",
            AuthError::Expired => "expired",
            AuthError::BadSignature => "bad_signature",
            AuthError::BadIssuer => "bad_issuer",
            AuthError::UnknownKeyId(_) => "bad_signature",
        }
    }
}

#[async_trait::async_trait]
pub trait BlocklistStore: Send + Sync {
    async fn is_blocked(&self, subject: &str) -> Result<bool, String>;
}

/// Default store with nothing blocked; also the shape used when a store is
/// unreachable (fail-open, `spec.md` §4.2 and the open question in §9).
pub struct NullBlocklist;

#[async_trait::async_trait]
impl BlocklistStore for NullBlocklist {
    async fn is_blocked(&self, _subject: &str) -> Result<bool, String> {
        Ok(false)
    }
}

/// Consult the blocklist with a fail-open default. O(1) lookup is the
/// store's responsibility; this wrapper only applies the documented
/// failure policy.
async fn check_blocklist(store: &dyn BlocklistStore, subject: &str) -> bool {
    match store.is_blocked(subject).await {
        Ok(blocked) => blocked,
        Err(err) => {
            tracing::warn!(subject, error = %err, "blocklist store unreachable, failing open");
            false
        }
    }
}

pub struct JwtVerifier {
    mode: VerifierMode,
    blocklist: Arc<dyn BlocklistStore>,
}

enum VerifierMode {
    Hmac {
        decoding_key: DecodingKey,
        validation: Validation,
    },
    Jwks {
        url: String,
        client: reqwest::Client,
        cache: JwksCache,
        clock_skew_secs: i64,
    },
}

impl JwtVerifier {
    pub fn from_config(config: &JwtConfig) -> Self {
        match config {
            JwtConfig::Hmac {
                secret,
                clock_skew_secs,
                blocklist: _,
            } => {
                let mut validation = Validation::new(Algorithm::HS256);
                validation.validate_exp = true;
                validation.leeway = (*clock_skew_secs).max(0) as u64;
                validation.required_spec_claims = Default::default();
                validation.validate_aud = false;
                Self {
                    mode: VerifierMode::Hmac {
                        decoding_key: DecodingKey::from_secret(secret.as_bytes()),
                        validation,
                    },
                    blocklist: Arc::new(NullBlocklist),
                }
            }
            JwtConfig::Jwks {
                url,
                ttl_secs,
                refresh_cooldown_secs,
                clock_skew_secs,
                blocklist: _,
            } => Self {
                mode: VerifierMode::Jwks {
                    url: url.clone(),
                    client: reqwest::Client::new(),
                    cache: JwksCache::new(Duration::from_secs(*ttl_secs), Duration::from_secs(*refresh_cooldown_secs)),
                    clock_skew_secs: *clock_skew_secs,
                },
                blocklist: Arc::new(NullBlocklist),
            },
        }
    }

    /// `verify(authorization_header) -> Claims | AuthError` (`spec.md` §4.2).
    pub async fn verify(&self, authorization_header: Option<&str>) -> Result<Claims, AuthError> {
        let header = authorization_header.ok_or(AuthError::Missing)?;
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .ok_or_else(|| AuthError::Malformed("expected Bearer scheme".into()))?;

        let claims = match &self.mode {
            VerifierMode::Hmac {
                decoding_key,
                validation,
            } => decode_with_key(token, decoding_key, validation)?,
            VerifierMode::Jwks {
                url,
                client,
                cache,
                clock_skew_secs,
            } => {
                let header = jsonwebtoken::decode_header(token)
                    .map_err(|err| AuthError::Malformed(err.to_string()))?;
                let kid = header.kid.ok_or_else(|| AuthError::Malformed("token missing kid".into()))?;

                let decoding_key = cache.get_or_refresh(client, url, &kid).await?;
                let mut validation = Validation::new(header.alg);
                validation.validate_exp = true;
                validation.leeway = (*clock_skew_secs).max(0) as u64;
                validation.validate_aud = false;
                decode_with_key(token, &decoding_key, &validation)?
            }
        };

        if check_blocklist(self.blocklist.as_ref(), &claims.sub).await {
            return Err(AuthError::BadSignature);
        }

        Ok(claims)
    }
}

fn decode_with_key(
    token: &str,
    key: &DecodingKey,
    validation: &Validation,
) -> Result<Claims, AuthError> {
    let data = decode::<RawClaims>(token, key, validation).map_err(|err| {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidIssuer => AuthError::BadIssuer,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            _ => AuthError::Malformed(err.to_string()),
        }
    })?;
    Ok(Claims::from(data.claims))
}

/// Single-flight JWKS cache: at most one in-flight fetch per key-id miss
/// across all workers (`spec.md` §5).
struct JwksCache {
    keys: RwLock<HashMap<String, DecodingKey>>,
    last_refresh: AsyncMutex<Option<Instant>>,
    inflight: AsyncMutex<()>,
    ttl: Duration,
    cooldown: Duration,
}

impl JwksCache {
    fn new(ttl: Duration, cooldown: Duration) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            last_refresh: AsyncMutex::new(None),
            inflight: AsyncMutex::new(()),
            ttl,
            cooldown,
        }
    }

    async fn get_or_refresh(
        &self,
        client: &reqwest::Client,
        url: &str,
        kid: &str,
    ) -> Result<DecodingKey, AuthError> {
        if !self.is_expired().await {
            if let Some(key) = self.lookup(kid).await {
                return Ok(key);
            }
        }

        // Single-flight: only one worker performs the network fetch; the
        // rest wait on this lock and then re-check the cache.
        let _guard = self.inflight.lock().await;
        if !self.is_expired().await {
            if let Some(key) = self.lookup(kid).await {
                return Ok(key);
            }
        }

        let mut last_refresh = self.last_refresh.lock().await;
        let should_fetch = match *last_refresh {
            Some(last) => last.elapsed() >= self.cooldown,
            None => true,
        };
        if !should_fetch {
            drop(last_refresh);
            return self
                .lookup(kid)
                .await
                .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()));
        }

        let jwk_set = fetch_jwk_set(client, url)
            .await
            .map_err(|err| AuthError::Malformed(format!("jwks fetch failed: {err}")))?;
        self.replace(jwk_set).await;
        *last_refresh = Some(Instant::now());
        drop(last_refresh);

        self.lookup(kid)
            .await
            .ok_or_else(|| AuthError::UnknownKeyId(kid.to_string()))
    }

    async fn lookup(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.read().await.get(kid).cloned()
    }

    async fn is_expired(&self) -> bool {
        match *self.last_refresh.lock().await {
            Some(last) => last.elapsed() >= self.ttl,
            None => true,
        }
    }

    async fn replace(&self, jwk_set: JwkSet) {
        let mut keys = HashMap::new();
        for jwk in jwk_set.keys {
            if let (Some(kid), Ok(key)) = (jwk.common.key_id.clone(), DecodingKey::from_jwk(&jwk)) {
                keys.insert(kid, key);
            }
        }
        *self.keys.write().await = keys;
    }

}

async fn fetch_jwk_set(client: &reqwest::Client, url: &str) -> Result<JwkSet, reqwest::Error> {
    client.get(url).send().await?.json::<JwkSet>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn hmac_verifier(secret: &str) -> JwtVerifier {
        JwtVerifier::from_config(&JwtConfig::Hmac {
            secret: secret.into(),
            clock_skew_secs: 60,
            blocklist: None,
        })
    }

    fn token_with_exp(secret: &str, exp_offset_secs: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = json!({
            "sub": "user-7",
            "username": "alice",
            "roles": ["member"],
            "exp": now + exp_offset_secs,
            "iat": now,
        });
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn accepts_valid_hmac_token() {
        let verifier = hmac_verifier("s3cr3t");
        let token = token_with_exp("s3cr3t", 3600);
        let claims = verifier
            .verify(Some(&format!("Bearer {token}")))
            .await
            .expect("valid token");
        assert_eq!(claims.sub, "user-7");
        assert_eq!(claims.roles, vec!["member".to_string()]);
    }

    #[tokio::test]
    async fn rejects_expired_token_at_exact_boundary() {
        let verifier = hmac_verifier("s3cr3t");
        // 120s in the past, beyond the 60s leeway.
        let token = token_with_exp("s3cr3t", -120);
        let err = verifier
            .verify(Some(&format!("Bearer {token}")))
            .await
            .expect_err("expired token rejected");
        assert_eq!(err, AuthError::Expired);
    }

    #[tokio::test]
    async fn accepts_token_within_clock_skew_window() {
        let verifier = hmac_verifier("s3cr3t");
        // exp 30s in the past is within the +/-60s skew tolerance.
        let token = token_with_exp("s3cr3t", -30);
        verifier
            .verify(Some(&format!("Bearer {token}")))
            .await
            .expect("within skew tolerance");
    }

    #[tokio::test]
    async fn rejects_bad_signature() {
        let verifier = hmac_verifier("s3cr3t");
        let token = token_with_exp("other-secret", 3600);
        let err = verifier
            .verify(Some(&format!("Bearer {token}")))
            .await
            .expect_err("bad signature rejected");
        assert_eq!(err, AuthError::BadSignature);
    }

    #[tokio::test]
    async fn missing_header_is_missing_credentials() {
        let verifier = hmac_verifier("s3cr3t");
        let err = verifier.verify(None).await.expect_err("missing header");
        assert_eq!(err, AuthError::Missing);
    }

    #[tokio::test]
    async fn space_separated_roles_are_split() {
        let verifier = hmac_verifier("s3cr3t");
        let now = chrono::Utc::now().timestamp();
        let claims = json!({ "sub": "u1", "roles": "member admin", "exp": now + 60 });
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret("s3cr3t".as_bytes()),
        )
        .unwrap();
        let result = verifier
            .verify(Some(&format!("Bearer {token}")))
            .await
            .unwrap();
        assert_eq!(result.roles, vec!["member".to_string(), "admin".to_string()]);
    }
}
