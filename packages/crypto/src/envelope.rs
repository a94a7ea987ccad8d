use aes_gcm::{
    aead::{Aead, Payload},
    Aes256Gcm, Key, KeyInit, Nonce,
};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::CryptoError;

/// AAD bound into every credential ciphertext. A blob lifted out of the
/// connections table cannot be replayed against a different decryption
/// context.
pub const CREDENTIALS_AAD: &[u8] = b"api-credentials";

const IV_LEN: usize = 12;

/// The persisted shape of one envelope encryption: base64 ciphertext
/// (tag appended by AES-GCM), base64 12-byte IV, and the key path that
/// can open it. `key_record_id` absent means the legacy process key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    pub ciphertext: String,
    pub iv: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_key_ciphertext: Option<String>,
}

/// Encrypts with a fresh random IV; returns `(iv, ciphertext+tag)`.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Seal)?;

    Ok((iv.to_vec(), ciphertext))
}

pub fn open(key: &[u8; 32], iv: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != IV_LEN {
        return Err(CryptoError::Open);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Open)
}

pub fn encode_b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

pub fn decode_b64(s: &str) -> Result<Vec<u8>, CryptoError> {
    B64.decode(s).map_err(|_| CryptoError::Open)
}
