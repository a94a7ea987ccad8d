use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use flowline_types::EncryptionKey;
use serde_json::Value;
use tracing::instrument;
use zeroize::Zeroizing;

use crate::{
    envelope::{self, EncryptedBlob, CREDENTIALS_AAD},
    CryptoError, Kms,
};

/// How long key-table records are trusted before a re-read.
const RECORD_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// How long unwrapped data-key plaintext may be reused.
const DATA_KEY_CACHE_TTL: Duration = Duration::from_secs(60);

/// Storage seam for the key table. The server implements this over its
/// typed-table store; tests use [`InMemoryKeyStore`].
pub trait KeyRecordStore: Send + Sync {
    fn list(&self) -> Result<Vec<EncryptionKey>, CryptoError>;
    fn get(&self, id: &str) -> Result<Option<EncryptionKey>, CryptoError>;
    fn put(&self, key: EncryptionKey) -> Result<(), CryptoError>;
}

#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: RwLock<HashMap<String, EncryptionKey>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyRecordStore for InMemoryKeyStore {
    fn list(&self) -> Result<Vec<EncryptionKey>, CryptoError> {
        Ok(self.keys.read().unwrap().values().cloned().collect())
    }

    fn get(&self, id: &str) -> Result<Option<EncryptionKey>, CryptoError> {
        Ok(self.keys.read().unwrap().get(id).cloned())
    }

    fn put(&self, key: EncryptionKey) -> Result<(), CryptoError> {
        self.keys.write().unwrap().insert(key.id.clone(), key);
        Ok(())
    }
}

struct RecordCache {
    fetched_at: Option<Instant>,
    records: Vec<EncryptionKey>,
}

/// Envelope encryption with three key sources, in precedence order:
/// a KMS-wrapped per-operation data key, a stored 32-byte derived key on
/// the key record, and the legacy process key derived from
/// `ENCRYPTION_MASTER_KEY`. At least one source must exist at
/// construction time.
pub struct KeyService {
    store: Arc<dyn KeyRecordStore>,
    kms: Option<Arc<dyn Kms>>,
    legacy_key: Option<Zeroizing<[u8; 32]>>,
    record_cache: RwLock<RecordCache>,
    // singleflight: only one task refreshes the record cache at a time
    refresh_lock: tokio::sync::Mutex<()>,
    data_key_cache: Mutex<HashMap<(String, String), (Instant, Zeroizing<[u8; 32]>)>>,
}

impl KeyService {
    pub fn new(
        store: Arc<dyn KeyRecordStore>,
        kms: Option<Arc<dyn Kms>>,
        legacy_key: Option<[u8; 32]>,
    ) -> Result<Self, CryptoError> {
        let has_stored_key = store
            .list()?
            .iter()
            .any(|k| k.is_active() && (k.derived_key.is_some() || k.kms_key_arn.is_some()));

        if kms.is_none() && legacy_key.is_none() && !has_stored_key {
            return Err(CryptoError::KeyUnavailable);
        }

        Ok(Self {
            store,
            kms,
            legacy_key: legacy_key.map(Zeroizing::new),
            record_cache: RwLock::new(RecordCache {
                fetched_at: None,
                records: Vec::new(),
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
            data_key_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Drops the record cache; called after rotation so the new active
    /// key takes effect immediately rather than at the next TTL expiry.
    pub fn force_refresh(&self) {
        self.record_cache.write().unwrap().fetched_at = None;
    }

    async fn records(&self) -> Result<Vec<EncryptionKey>, CryptoError> {
        {
            let cache = self.record_cache.read().unwrap();
            if let Some(at) = cache.fetched_at {
                if at.elapsed() < RECORD_CACHE_TTL {
                    return Ok(cache.records.clone());
                }
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // another task may have refreshed while we waited
        {
            let cache = self.record_cache.read().unwrap();
            if let Some(at) = cache.fetched_at {
                if at.elapsed() < RECORD_CACHE_TTL {
                    return Ok(cache.records.clone());
                }
            }
        }

        let records = self.store.list()?;
        let mut cache = self.record_cache.write().unwrap();
        cache.records = records.clone();
        cache.fetched_at = Some(Instant::now());
        Ok(records)
    }

    async fn record(&self, id: &str) -> Result<Option<EncryptionKey>, CryptoError> {
        if let Some(found) = self.records().await?.into_iter().find(|k| k.id == id) {
            return Ok(Some(found));
        }
        // cache miss can mean a record created since the last refresh
        self.store.get(id)
    }

    fn decode_derived_key(record: &EncryptionKey) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let encoded = record
            .derived_key
            .as_ref()
            .ok_or_else(|| CryptoError::KeyMaterialMalformed(record.id.clone()))?;
        let bytes = B64
            .decode(encoded.as_str())
            .map_err(|_| CryptoError::KeyMaterialMalformed(record.id.clone()))?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::KeyMaterialMalformed(record.id.clone()))?;
        Ok(Zeroizing::new(key))
    }

    fn cached_data_key(&self, record_id: &str, wrapped: &str) -> Option<Zeroizing<[u8; 32]>> {
        let cache = self.data_key_cache.lock().unwrap();
        cache
            .get(&(record_id.to_string(), wrapped.to_string()))
            .filter(|(at, _)| at.elapsed() < DATA_KEY_CACHE_TTL)
            .map(|(_, key)| key.clone())
    }

    fn cache_data_key(&self, record_id: &str, wrapped: &str, key: Zeroizing<[u8; 32]>) {
        let mut cache = self.data_key_cache.lock().unwrap();
        cache.retain(|_, (at, _)| at.elapsed() < DATA_KEY_CACHE_TTL);
        cache.insert(
            (record_id.to_string(), wrapped.to_string()),
            (Instant::now(), key),
        );
    }

    fn legacy(&self) -> Result<&Zeroizing<[u8; 32]>, CryptoError> {
        self.legacy_key.as_ref().ok_or(CryptoError::KeyUnavailable)
    }

    /// Encrypts under the active key record, minting a KMS data key when
    /// the record points at a KEK; falls back through the stored derived
    /// key and finally the legacy key.
    #[instrument(level = "debug", skip_all, fields(subsys = "KeyService"))]
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, CryptoError> {
        let active = self
            .records()
            .await?
            .into_iter()
            .find(EncryptionKey::is_active);

        if let Some(record) = active {
            if let (Some(arn), Some(kms)) = (record.kms_key_arn.as_deref(), self.kms.as_ref()) {
                match kms.generate_data_key(arn).await {
                    Ok(data_key) => {
                        let (iv, ct) = envelope::seal(&data_key.plaintext, plaintext, CREDENTIALS_AAD)?;
                        let wrapped = envelope::encode_b64(&data_key.ciphertext);
                        self.cache_data_key(&record.id, &wrapped, data_key.plaintext.clone());
                        return Ok(EncryptedBlob {
                            ciphertext: envelope::encode_b64(&ct),
                            iv: envelope::encode_b64(&iv),
                            key_record_id: Some(record.id),
                            data_key_ciphertext: Some(wrapped),
                        });
                    }
                    Err(err) => {
                        tracing::warn!(
                            key_record = %record.id,
                            "KMS data key generation failed, trying stored key: {}",
                            err
                        );
                    }
                }
            }

            match Self::decode_derived_key(&record) {
                Ok(key) => {
                    let (iv, ct) = envelope::seal(&key, plaintext, CREDENTIALS_AAD)?;
                    return Ok(EncryptedBlob {
                        ciphertext: envelope::encode_b64(&ct),
                        iv: envelope::encode_b64(&iv),
                        key_record_id: Some(record.id),
                        data_key_ciphertext: None,
                    });
                }
                Err(err) => {
                    // skip the unusable record and keep serving
                    tracing::warn!(key_record = %record.id, "skipping key record: {}", err);
                }
            }
        }

        let legacy = self.legacy()?;
        let (iv, ct) = envelope::seal(legacy, plaintext, CREDENTIALS_AAD)?;
        Ok(EncryptedBlob {
            ciphertext: envelope::encode_b64(&ct),
            iv: envelope::encode_b64(&iv),
            key_record_id: None,
            data_key_ciphertext: None,
        })
    }

    /// Resolution order: KMS-unwrapped data key, stored derived key,
    /// legacy key (logged). A record id that resolves to nothing falls
    /// back to the legacy key only when one is configured.
    #[instrument(level = "debug", skip_all, fields(subsys = "KeyService"))]
    pub async fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>, CryptoError> {
        let iv = envelope::decode_b64(&blob.iv)?;
        let ct = envelope::decode_b64(&blob.ciphertext)?;

        let record = match blob.key_record_id.as_deref() {
            Some(id) => match self.record(id).await? {
                Some(record) => Some(record),
                None => {
                    if self.legacy_key.is_some() {
                        tracing::warn!(
                            key_record = id,
                            "key record not found, falling back to legacy key"
                        );
                        None
                    } else {
                        return Err(CryptoError::KeyRecordNotFound(id.to_string()));
                    }
                }
            },
            None => None,
        };

        if let Some(record) = record {
            if let (Some(wrapped), Some(arn)) =
                (blob.data_key_ciphertext.as_deref(), record.kms_key_arn.as_deref())
            {
                if let Some(key) = self.cached_data_key(&record.id, wrapped) {
                    return envelope::open(&key, &iv, &ct, CREDENTIALS_AAD);
                }

                if let Some(kms) = self.kms.as_ref() {
                    let wrapped_bytes = envelope::decode_b64(wrapped)?;
                    match kms.decrypt_data_key(arn, &wrapped_bytes).await {
                        Ok(key) => {
                            self.cache_data_key(&record.id, wrapped, key.clone());
                            return envelope::open(&key, &iv, &ct, CREDENTIALS_AAD);
                        }
                        Err(err) => {
                            if record.derived_key.is_some() {
                                tracing::warn!(
                                    key_record = %record.id,
                                    "KMS decrypt failed, trying stored key: {}",
                                    err
                                );
                            } else {
                                return Err(err);
                            }
                        }
                    }
                }
            }

            if record.derived_key.is_some() {
                let key = Self::decode_derived_key(&record)?;
                return envelope::open(&key, &iv, &ct, CREDENTIALS_AAD);
            }

            if self.legacy_key.is_none() {
                return Err(CryptoError::KeyUnavailable);
            }
            tracing::warn!(
                key_record = %record.id,
                "key record has no usable material, falling back to legacy key"
            );
        }

        let legacy = self.legacy()?;
        envelope::open(legacy, &iv, &ct, CREDENTIALS_AAD)
    }

    /// JSON wrapper around [`Self::encrypt`].
    pub async fn encrypt_credentials(&self, credentials: &Value) -> Result<EncryptedBlob, CryptoError> {
        let plaintext = serde_json::to_vec(credentials)?;
        self.encrypt(&plaintext).await
    }

    /// JSON wrapper around [`Self::decrypt`].
    pub async fn decrypt_credentials(&self, blob: &EncryptedBlob) -> Result<Value, CryptoError> {
        let plaintext = self.decrypt(blob).await?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Installs a new active key: the previous active record is marked
    /// rotating, every older rotating record is retired, and the caches
    /// are dropped so the change takes effect immediately.
    #[instrument(level = "debug", skip_all, fields(subsys = "KeyService", key_record = %new_key.id))]
    pub async fn rotate(&self, new_key: EncryptionKey) -> Result<(), CryptoError> {
        use flowline_types::KeyStatus;

        let now = chrono::Utc::now();
        for mut record in self.store.list()? {
            match record.status {
                KeyStatus::Active => {
                    record.status = KeyStatus::Rotating;
                    record.rotated_at = Some(now);
                    self.store.put(record)?;
                }
                KeyStatus::Rotating => {
                    record.status = KeyStatus::Retired;
                    self.store.put(record)?;
                }
                KeyStatus::Retired => {}
            }
        }

        self.store.put(new_key)?;
        self.force_refresh();
        Ok(())
    }
}
