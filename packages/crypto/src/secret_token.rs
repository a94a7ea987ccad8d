use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine};
use chrono::{DateTime, Duration, Utc};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::{envelope, CryptoError};

type HmacSha256 = Hmac<Sha256>;

const VERSION: u8 = 1;
const HKDF_SALT: &[u8] = b"flowline-secret-token-v1";
const MIN_TTL: Duration = Duration::seconds(60);
const DEFAULT_TTL: Duration = Duration::seconds(5 * 60);

#[derive(Serialize, Deserialize, Clone, Debug)]
struct TokenPackage {
    v: u8,
    iv: String,
    ciphertext: String,
    issued_at: i64,
    expires_at: i64,
    purpose: String,
    mac: String,
}

/// Issues and reads versioned, purpose-scoped encrypted packages for the
/// script-runtime callback channel. The encryption and MAC keys are both
/// HKDF-derived from the process master secret with the purpose baked
/// into the derivation, so a token minted for one purpose cannot be
/// replayed against another.
pub struct SecretTokenService {
    master: Zeroizing<Vec<u8>>,
    clock_tolerance: Duration,
}

impl SecretTokenService {
    pub fn new(master: impl Into<Vec<u8>>, clock_tolerance: Duration) -> Self {
        Self {
            master: Zeroizing::new(master.into()),
            clock_tolerance,
        }
    }

    fn derive_keys(&self, purpose: &str) -> Result<(Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>), CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &self.master);

        let mut enc = Zeroizing::new([0u8; 32]);
        hk.expand(format!("enc|{}", purpose).as_bytes(), enc.as_mut())
            .map_err(|_| CryptoError::KdfOutput)?;

        let mut mac = Zeroizing::new([0u8; 32]);
        hk.expand(format!("mac|{}", purpose).as_bytes(), mac.as_mut())
            .map_err(|_| CryptoError::KdfOutput)?;

        Ok((enc, mac))
    }

    fn mac_input(iv: &str, ciphertext: &str, issued_at: i64, expires_at: i64, purpose: &str) -> String {
        // deterministic field order; any change here is a version bump
        format!("{}|{}|{}|{}|{}", iv, ciphertext, issued_at, expires_at, purpose)
    }

    /// TTLs are clamped to at least one minute; `None` means the default
    /// five minutes.
    pub fn create(
        &self,
        payload: &Value,
        ttl: Option<Duration>,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<String, CryptoError> {
        let ttl = ttl.unwrap_or(DEFAULT_TTL).max(MIN_TTL);
        let (enc_key, mac_key) = self.derive_keys(purpose)?;

        let plaintext = serde_json::to_vec(payload)?;
        let (iv, ct) = envelope::seal(&enc_key, &plaintext, purpose.as_bytes())?;

        let iv = B64URL.encode(iv);
        let ciphertext = B64URL.encode(ct);
        let issued_at = now.timestamp();
        let expires_at = (now + ttl).timestamp();

        let mut mac = HmacSha256::new_from_slice(mac_key.as_ref())
            .map_err(|_| CryptoError::KdfOutput)?;
        mac.update(Self::mac_input(&iv, &ciphertext, issued_at, expires_at, purpose).as_bytes());
        let mac = B64URL.encode(mac.finalize().into_bytes());

        let package = TokenPackage {
            v: VERSION,
            iv,
            ciphertext,
            issued_at,
            expires_at,
            purpose: purpose.to_string(),
            mac,
        };

        Ok(B64URL.encode(serde_json::to_vec(&package)?))
    }

    pub fn read(
        &self,
        token: &str,
        expected_purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<Value, CryptoError> {
        let raw = B64URL.decode(token).map_err(|_| CryptoError::TokenMalformed)?;
        let package: TokenPackage =
            serde_json::from_slice(&raw).map_err(|_| CryptoError::TokenMalformed)?;

        if package.v != VERSION {
            return Err(CryptoError::TokenMalformed);
        }
        if package.purpose != expected_purpose {
            return Err(CryptoError::TokenPurposeMismatch {
                expected: expected_purpose.to_string(),
            });
        }

        // verify the seal before looking at timestamps so a forged token
        // learns nothing from error ordering
        let (enc_key, mac_key) = self.derive_keys(expected_purpose)?;
        let mut mac = HmacSha256::new_from_slice(mac_key.as_ref())
            .map_err(|_| CryptoError::KdfOutput)?;
        mac.update(
            Self::mac_input(
                &package.iv,
                &package.ciphertext,
                package.issued_at,
                package.expires_at,
                &package.purpose,
            )
            .as_bytes(),
        );
        let computed = mac.finalize().into_bytes();
        let presented = B64URL
            .decode(&package.mac)
            .map_err(|_| CryptoError::TokenMalformed)?;
        if !bool::from(computed.ct_eq(presented.as_slice())) {
            return Err(CryptoError::TokenSignatureMismatch);
        }

        let expires_at = DateTime::<Utc>::from_timestamp(package.expires_at, 0)
            .ok_or(CryptoError::TokenMalformed)?;
        let issued_at = DateTime::<Utc>::from_timestamp(package.issued_at, 0)
            .ok_or(CryptoError::TokenMalformed)?;
        if now > expires_at + self.clock_tolerance {
            return Err(CryptoError::TokenExpired);
        }
        if issued_at > now + self.clock_tolerance {
            return Err(CryptoError::TokenMalformed);
        }

        let iv = B64URL.decode(&package.iv).map_err(|_| CryptoError::TokenMalformed)?;
        let ct = B64URL
            .decode(&package.ciphertext)
            .map_err(|_| CryptoError::TokenMalformed)?;
        let plaintext = envelope::open(&enc_key, &iv, &ct, expected_purpose.as_bytes())?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> SecretTokenService {
        SecretTokenService::new(
            b"a-sufficiently-long-master-secret".to_vec(),
            Duration::seconds(30),
        )
    }

    #[test]
    fn round_trip() {
        let svc = service();
        let now = Utc::now();
        let payload = json!({"stepId": "node-1", "connectionId": "abc"});

        let token = svc.create(&payload, None, "apps-script", now).unwrap();
        let back = svc.read(&token, "apps-script", now).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn purpose_mismatch_is_rejected() {
        let svc = service();
        let now = Utc::now();
        let token = svc.create(&json!({}), None, "apps-script", now).unwrap();

        assert!(matches!(
            svc.read(&token, "other-purpose", now),
            Err(CryptoError::TokenPurposeMismatch { .. })
        ));
    }

    #[test]
    fn expiry_honors_clock_tolerance() {
        let svc = service();
        let now = Utc::now();
        let token = svc
            .create(&json!({}), Some(Duration::seconds(60)), "apps-script", now)
            .unwrap();

        // just past expiry but within tolerance
        svc.read(&token, "apps-script", now + Duration::seconds(80))
            .unwrap();
        // beyond tolerance
        assert!(matches!(
            svc.read(&token, "apps-script", now + Duration::seconds(120)),
            Err(CryptoError::TokenExpired)
        ));
    }

    #[test]
    fn ttl_is_clamped_to_minimum() {
        let svc = service();
        let now = Utc::now();
        let token = svc
            .create(&json!({}), Some(Duration::seconds(1)), "apps-script", now)
            .unwrap();

        // one second in, a one-second TTL would already be expired; the
        // clamp keeps it alive for the 60-second floor
        svc.read(&token, "apps-script", now + Duration::seconds(20))
            .unwrap();
    }

    #[test]
    fn tampered_token_is_rejected() {
        let svc = service();
        let now = Utc::now();
        let token = svc.create(&json!({"k": 1}), None, "apps-script", now).unwrap();

        let mut raw = B64URL.decode(&token).unwrap();
        // flip a byte somewhere inside the ciphertext field
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        let tampered = B64URL.encode(raw);

        assert!(svc.read(&tampered, "apps-script", now).is_err());
    }

    #[test]
    fn different_master_secret_cannot_read() {
        let svc = service();
        let other = SecretTokenService::new(b"another-master-secret-entirely!!".to_vec(), Duration::zero());
        let now = Utc::now();

        let token = svc.create(&json!({}), None, "apps-script", now).unwrap();
        assert!(matches!(
            other.read(&token, "apps-script", now),
            Err(CryptoError::TokenSignatureMismatch)
        ));
    }
}
