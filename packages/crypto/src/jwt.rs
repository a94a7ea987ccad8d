use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::CryptoError;

const DEV_FALLBACK_SECRET: &str = "flowline-dev-only-jwt-secret";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 token issue/verify. The signing secret comes from `JWT_SECRET`;
/// the hardcoded fallback is accepted only when the process was
/// explicitly started in development mode.
pub struct JwtService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    secret: Vec<u8>,
}

impl JwtService {
    pub fn new(secret: Option<&str>, development: bool) -> Result<Self, CryptoError> {
        let secret = match secret {
            Some(secret) if !secret.is_empty() => secret.to_string(),
            _ if development => {
                tracing::warn!("JWT_SECRET not set, using development fallback secret");
                DEV_FALLBACK_SECRET.to_string()
            }
            _ => return Err(CryptoError::JwtSecretMissing),
        };

        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            secret: secret.into_bytes(),
        })
    }

    pub fn issue(
        &self,
        sub: impl Into<String>,
        org: Option<String>,
        purpose: Option<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, CryptoError> {
        let claims = Claims {
            sub: sub.into(),
            org,
            purpose,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, CryptoError> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))?;
        Ok(data.claims)
    }

    /// Raw HMAC secret, reused to sign resume tokens so a callback URL
    /// can be validated without a database roundtrip.
    pub fn secret_bytes(&self) -> &[u8] {
        &self.secret
    }
}
