use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::CryptoError;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 64;

fn params() -> Result<scrypt::Params, CryptoError> {
    // N=16384, r=8, p=1
    scrypt::Params::new(14, 8, 1, HASH_LEN).map_err(|_| CryptoError::KdfParams)
}

/// scrypt password hash, stored as `salt_hex:hash_hex` with a random
/// 16-byte salt and 64-byte output.
pub fn hash_password(password: &str) -> Result<String, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);

    let mut hash = [0u8; HASH_LEN];
    scrypt::scrypt(password.as_bytes(), &salt, &params()?, &mut hash)
        .map_err(|_| CryptoError::KdfOutput)?;

    Ok(format!(
        "{}:{}",
        const_hex::encode(salt),
        const_hex::encode(hash)
    ))
}

/// Constant-time verification against a stored `salt_hex:hash_hex`.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, CryptoError> {
    let (salt_hex, hash_hex) = stored
        .split_once(':')
        .ok_or(CryptoError::PasswordHashMalformed)?;

    let salt = const_hex::decode(salt_hex).map_err(|_| CryptoError::PasswordHashMalformed)?;
    let expected = const_hex::decode(hash_hex).map_err(|_| CryptoError::PasswordHashMalformed)?;
    if salt.len() != SALT_LEN || expected.len() != HASH_LEN {
        return Err(CryptoError::PasswordHashMalformed);
    }

    let mut hash = [0u8; HASH_LEN];
    scrypt::scrypt(password.as_bytes(), &salt, &params()?, &mut hash)
        .map_err(|_| CryptoError::KdfOutput)?;

    Ok(hash.ct_eq(expected.as_slice()).into())
}
