use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("ENCRYPTION_MASTER_KEY must be at least 32 characters")]
    MasterKeyTooShort,

    #[error("invalid kdf parameters")]
    KdfParams,

    #[error("kdf output failed")]
    KdfOutput,

    #[error("encryption failed")]
    Seal,

    // deliberately carries no detail: a tag failure and a bad key look
    // identical to the caller
    #[error("decryption failed")]
    Open,

    #[error("no usable key source: kms, stored keys and legacy key all unavailable")]
    KeyUnavailable,

    #[error("key record {0} not found")]
    KeyRecordNotFound(String),

    #[error("key material for record {0} is malformed")]
    KeyMaterialMalformed(String),

    #[error("kms provider {0} is not compiled into this build")]
    KmsProviderUnavailable(String),

    #[error("kms: {0}")]
    Kms(String),

    #[error("key store: {0}")]
    KeyStore(String),

    #[error("password hash is malformed")]
    PasswordHashMalformed,

    #[error("jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("jwt secret is not configured")]
    JwtSecretMissing,

    #[error("secret token is malformed")]
    TokenMalformed,

    #[error("secret token signature mismatch")]
    TokenSignatureMismatch,

    #[error("secret token expired")]
    TokenExpired,

    #[error("secret token purpose mismatch: expected {expected}")]
    TokenPurposeMismatch { expected: String },

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}
