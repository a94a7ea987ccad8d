pub mod envelope;
pub mod error;
pub mod jwt;
pub mod keys;
pub mod kms;
pub mod password;
pub mod secret_token;

pub use envelope::{open, seal, EncryptedBlob, CREDENTIALS_AAD};
pub use error::CryptoError;
pub use jwt::{Claims, JwtService};
pub use keys::{InMemoryKeyStore, KeyRecordStore, KeyService};
pub use kms::{DataKey, Kms, KmsProvider, LocalKms};
pub use password::{hash_password, verify_password};
pub use secret_token::SecretTokenService;

/// Derives the 32-byte legacy process key from `ENCRYPTION_MASTER_KEY`
/// via scrypt with a fixed salt. The fixed salt is deliberate: the same
/// master key must derive the same legacy key on every host so records
/// sealed before the key table existed stay readable.
pub fn derive_legacy_key(master_key: &str) -> Result<[u8; 32], CryptoError> {
    const LEGACY_SALT: &[u8] = b"flowline-legacy-key-v1";

    if master_key.len() < 32 {
        return Err(CryptoError::MasterKeyTooShort);
    }

    let params = scrypt::Params::new(14, 8, 1, 32).map_err(|_| CryptoError::KdfParams)?;
    let mut out = [0u8; 32];
    scrypt::scrypt(master_key.as_bytes(), LEGACY_SALT, &params, &mut out)
        .map_err(|_| CryptoError::KdfOutput)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_key_is_deterministic() {
        let master = "0123456789abcdef0123456789abcdef";
        let a = derive_legacy_key(master).unwrap();
        let b = derive_legacy_key(master).unwrap();
        assert_eq!(a, b);

        let c = derive_legacy_key("fedcba9876543210fedcba9876543210").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn short_master_key_is_rejected() {
        assert!(matches!(
            derive_legacy_key("too-short"),
            Err(CryptoError::MasterKeyTooShort)
        ));
    }
}
