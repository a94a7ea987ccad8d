use async_trait::async_trait;
use rand::RngCore;
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::{envelope, CryptoError};

/// A freshly generated data key: the plaintext half stays in memory just
/// long enough to encrypt, the wrapped half is what gets persisted next
/// to the ciphertext.
pub struct DataKey {
    pub plaintext: Zeroizing<[u8; 32]>,
    pub ciphertext: Vec<u8>,
}

/// The key-management seam. One call pair: mint a wrapped data key under
/// a named KEK, and unwrap one later. Transport, auth and retries belong
/// to the provider adapter behind this trait.
#[async_trait]
pub trait Kms: Send + Sync {
    async fn generate_data_key(&self, key_arn: &str) -> Result<DataKey, CryptoError>;

    async fn decrypt_data_key(
        &self,
        key_arn: &str,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KmsProvider {
    Aws,
    Gcp,
    Local,
}

impl FromStr for KmsProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(KmsProvider::Aws),
            "gcp" => Ok(KmsProvider::Gcp),
            "local" => Ok(KmsProvider::Local),
            other => Err(format!("unknown kms provider: {}", other)),
        }
    }
}

/// Wraps data keys with AES-GCM under a locally held KEK. This is the
/// provider shipped with the core; the aws/gcp adapters live with the
/// deployment integrations and implement the same trait.
pub struct LocalKms {
    kek: Zeroizing<[u8; 32]>,
}

impl LocalKms {
    pub fn new(kek: [u8; 32]) -> Self {
        Self {
            kek: Zeroizing::new(kek),
        }
    }
}

const LOCAL_KMS_AAD: &[u8] = b"flowline-local-kms";

#[async_trait]
impl Kms for LocalKms {
    async fn generate_data_key(&self, key_arn: &str) -> Result<DataKey, CryptoError> {
        let mut plaintext = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(plaintext.as_mut());

        // bind the KEK name into the AAD so a blob wrapped under one arn
        // cannot be unwrapped by naming another
        let aad = [LOCAL_KMS_AAD, b"|", key_arn.as_bytes()].concat();
        let (iv, ct) = envelope::seal(&self.kek, plaintext.as_ref(), &aad)?;

        let mut ciphertext = iv;
        ciphertext.extend_from_slice(&ct);

        Ok(DataKey {
            plaintext,
            ciphertext,
        })
    }

    async fn decrypt_data_key(
        &self,
        key_arn: &str,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        if ciphertext.len() < 12 + 32 + 16 {
            return Err(CryptoError::Kms("wrapped key too short".to_string()));
        }
        let (iv, ct) = ciphertext.split_at(12);

        let aad = [LOCAL_KMS_AAD, b"|", key_arn.as_bytes()].concat();
        let plaintext = envelope::open(&self.kek, iv, ct, &aad)?;

        let key: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Kms("unwrapped key has wrong length".to_string()))?;
        Ok(Zeroizing::new(key))
    }
}

/// Builds the configured provider. `aws` and `gcp` are recognized so
/// configuration validates uniformly, but their adapters are not part of
/// the core build.
pub fn build_provider(
    provider: KmsProvider,
    local_kek: Option<[u8; 32]>,
) -> Result<std::sync::Arc<dyn Kms>, CryptoError> {
    match provider {
        KmsProvider::Local => {
            let kek = local_kek.ok_or(CryptoError::KeyUnavailable)?;
            Ok(std::sync::Arc::new(LocalKms::new(kek)))
        }
        KmsProvider::Aws => Err(CryptoError::KmsProviderUnavailable("aws".to_string())),
        KmsProvider::Gcp => Err(CryptoError::KmsProviderUnavailable("gcp".to_string())),
    }
}
