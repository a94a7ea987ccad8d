use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine};
use chrono::{Duration, Utc};
use flowline_crypto::{CryptoError, EncryptedBlob, KeyService};
use flowline_engine::{ConnectorInvoker, CredentialResolver, EngineError};
use flowline_types::{
    sha256_hex, Connection, ConnectionId, ConnectionTestResult, ConnectionType, MaskedConnection,
    OrganizationId, ScopedToken, SecretAccessEvent, SecretAccessKind, TestStatus, TokenId, UserId,
};
use rand::RngCore;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::instrument;
use utils::storage::db::{handles, CoreDb, DBError};
use utils::storage::fs::JsonFileStore;

/// Credential store. Every record is envelope-encrypted through the key
/// service before it reaches either backend; the file backend exists for
/// development only and is gated twice (config flag and non-production)
/// before construction.
pub struct ConnectionStore {
    db: CoreDb,
    file: Option<Arc<JsonFileStore>>,
    keys: Arc<KeyService>,
    invoker: Arc<dyn ConnectorInvoker>,
    http: reqwest::Client,
}

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    #[error("a connection named {name} for {provider} already exists")]
    Duplicate { provider: String, name: String },

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("db: {0}")]
    Db(#[from] DBError),

    #[error("file store: {0}")]
    File(#[from] utils::storage::fs::FileStoreError),

    #[error("scoped token expired")]
    TokenExpired,

    #[error("scoped token already consumed")]
    TokenConsumed,

    #[error("scoped token unknown")]
    TokenUnknown,
}

type FileDoc = BTreeMap<ConnectionId, Connection>;

impl ConnectionStore {
    pub fn new(
        db: CoreDb,
        keys: Arc<KeyService>,
        invoker: Arc<dyn ConnectorInvoker>,
        file: Option<Arc<JsonFileStore>>,
    ) -> Self {
        if file.is_some() {
            tracing::warn!("file-backed connection store enabled; development use only");
        }
        Self {
            db,
            file,
            keys,
            invoker,
            http: reqwest::Client::new(),
        }
    }

    fn audit(&self, kind: SecretAccessKind, conn: &Connection, metadata: Value) {
        let event = SecretAccessEvent {
            kind,
            provider: conn.provider.clone(),
            user_id: conn.user_id,
            organization_id: conn.organization_id,
            metadata,
            at: Utc::now(),
        };
        // the audit stream is the structured log; it carries labels and
        // correlation ids, never secret material
        tracing::info!(
            target: "secret_access",
            kind = ?event.kind,
            provider = %event.provider,
            user_id = %event.user_id,
            organization_id = %event.organization_id,
            "secret access"
        );
    }

    fn backend_put(&self, conn: Connection) -> Result<(), ConnectionError> {
        match &self.file {
            Some(file) => {
                file.modify(|doc: &mut FileDoc| doc.insert(conn.id, conn))?;
            }
            None => self.db.set(&handles::CONNECTIONS, conn.id, conn)?,
        }
        Ok(())
    }

    fn backend_get(&self, id: &ConnectionId) -> Result<Option<Connection>, ConnectionError> {
        match &self.file {
            Some(file) => {
                let doc: FileDoc = file.read()?;
                Ok(doc.get(id).cloned())
            }
            None => Ok(self.db.get(&handles::CONNECTIONS, id)?),
        }
    }

    fn backend_collect(
        &self,
        mut pred: impl FnMut(&Connection) -> bool,
    ) -> Result<Vec<Connection>, ConnectionError> {
        match &self.file {
            Some(file) => {
                let doc: FileDoc = file.read()?;
                Ok(doc.into_values().filter(|c| pred(c)).collect())
            }
            None => Ok(self.db.collect_where(&handles::CONNECTIONS, |_, c| pred(c))?),
        }
    }

    #[instrument(level = "debug", skip_all, fields(subsys = "ConnectionStore", provider))]
    pub async fn create(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        provider: impl Into<String>,
        name: impl Into<String>,
        connection_type: ConnectionType,
        credentials: &Value,
        metadata: Value,
    ) -> Result<Connection, ConnectionError> {
        let provider = provider.into();
        let name = name.into();

        let duplicate = self
            .backend_collect(|c| {
                c.is_active
                    && c.organization_id == organization_id
                    && c.user_id == user_id
                    && c.provider == provider
                    && c.name == name
            })?
            .into_iter()
            .next();
        if duplicate.is_some() {
            return Err(ConnectionError::Duplicate { provider, name });
        }

        let blob = self.keys.encrypt_credentials(credentials).await?;
        let now = Utc::now();
        let conn = Connection {
            id: ConnectionId::generate(),
            organization_id,
            user_id,
            provider,
            name,
            connection_type,
            encrypted_credentials: blob.ciphertext,
            iv: blob.iv,
            encryption_key_id: blob.key_record_id,
            data_key_ciphertext: blob.data_key_ciphertext,
            metadata,
            test_status: None,
            test_error: None,
            last_tested: None,
            last_used: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        self.backend_put(conn.clone())?;
        self.audit(SecretAccessKind::Write, &conn, json!({"action": "create"}));
        Ok(conn)
    }

    pub fn get(&self, id: &ConnectionId) -> Result<Connection, ConnectionError> {
        let conn = self
            .backend_get(id)?
            .filter(|c| c.is_active)
            .ok_or(ConnectionError::NotFound(*id))?;
        self.audit(SecretAccessKind::Read, &conn, json!({"action": "get"}));
        Ok(conn)
    }

    pub fn list(
        &self,
        organization_id: &OrganizationId,
        provider: Option<&str>,
    ) -> Result<Vec<Connection>, ConnectionError> {
        self.backend_collect(|c| {
            c.is_active
                && c.organization_id == *organization_id
                && provider.map(|p| c.provider == p).unwrap_or(true)
        })
    }

    pub fn get_by_provider(
        &self,
        organization_id: &OrganizationId,
        user_id: &UserId,
        provider: &str,
    ) -> Result<Option<Connection>, ConnectionError> {
        Ok(self
            .backend_collect(|c| {
                c.is_active
                    && c.organization_id == *organization_id
                    && c.user_id == *user_id
                    && c.provider == provider
            })?
            .into_iter()
            .next())
    }

    /// Decrypts a connection's credential blob.
    #[instrument(level = "debug", skip(self), fields(subsys = "ConnectionStore"))]
    pub async fn credentials(&self, id: &ConnectionId) -> Result<Value, ConnectionError> {
        let conn = self.get(id)?;
        let blob = EncryptedBlob {
            ciphertext: conn.encrypted_credentials.clone(),
            iv: conn.iv.clone(),
            key_record_id: conn.encryption_key_id.clone(),
            data_key_ciphertext: conn.data_key_ciphertext.clone(),
        };
        Ok(self.keys.decrypt_credentials(&blob).await?)
    }

    pub async fn update(
        &self,
        id: &ConnectionId,
        credentials: Option<&Value>,
        metadata: Option<Value>,
    ) -> Result<Connection, ConnectionError> {
        let mut conn = self.get(id)?;

        if let Some(credentials) = credentials {
            let blob = self.keys.encrypt_credentials(credentials).await?;
            conn.encrypted_credentials = blob.ciphertext;
            conn.iv = blob.iv;
            conn.encryption_key_id = blob.key_record_id;
            conn.data_key_ciphertext = blob.data_key_ciphertext;
        }
        if let Some(metadata) = metadata {
            conn.metadata = metadata;
        }
        conn.updated_at = Utc::now();

        self.backend_put(conn.clone())?;
        self.audit(SecretAccessKind::Write, &conn, json!({"action": "update"}));
        Ok(conn)
    }

    pub fn soft_delete(&self, id: &ConnectionId) -> Result<(), ConnectionError> {
        let mut conn = self.backend_get(id)?.ok_or(ConnectionError::NotFound(*id))?;
        conn.is_active = false;
        conn.updated_at = Utc::now();
        self.audit(SecretAccessKind::Delete, &conn, json!({"action": "delete"}));
        self.backend_put(conn)?;
        Ok(())
    }

    pub fn mark_used(&self, id: &ConnectionId) -> Result<(), ConnectionError> {
        let mut conn = self.backend_get(id)?.ok_or(ConnectionError::NotFound(*id))?;
        conn.last_used = Some(Utc::now());
        self.backend_put(conn)?;
        Ok(())
    }

    /// Masked inventory export: enough to see what exists, never enough
    /// to use it.
    pub fn export_masked(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<MaskedConnection>, ConnectionError> {
        Ok(self
            .list(organization_id, None)?
            .iter()
            .map(MaskedConnection::from)
            .collect())
    }

    pub async fn import(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        entries: Vec<(String, String, ConnectionType, Value)>,
    ) -> Result<Vec<Connection>, ConnectionError> {
        let mut imported = Vec::with_capacity(entries.len());
        for (provider, name, connection_type, credentials) in entries {
            imported.push(
                self.create(
                    organization_id,
                    user_id,
                    provider,
                    name,
                    connection_type,
                    &credentials,
                    json!({"imported": true}),
                )
                .await?,
            );
        }
        Ok(imported)
    }

    /// OAuth upsert: one OAuth connection per `(user, provider)`. A
    /// token refresh overwrites in place instead of accumulating rows.
    pub async fn store_oauth(
        &self,
        organization_id: OrganizationId,
        user_id: UserId,
        provider: &str,
        credentials: &Value,
    ) -> Result<Connection, ConnectionError> {
        let existing = self
            .backend_collect(|c| {
                c.is_active
                    && c.organization_id == organization_id
                    && c.user_id == user_id
                    && c.provider == provider
                    && c.connection_type == ConnectionType::OAuth
            })?
            .into_iter()
            .next();

        match existing {
            Some(conn) => self.update(&conn.id, Some(credentials), None).await,
            None => {
                self.create(
                    organization_id,
                    user_id,
                    provider,
                    format!("{}-oauth", provider),
                    ConnectionType::OAuth,
                    credentials,
                    json!({}),
                )
                .await
            }
        }
    }

    /// Probes the connection against its provider and persists the
    /// outcome on the record.
    #[instrument(level = "debug", skip(self), fields(subsys = "ConnectionStore"))]
    pub async fn test(&self, id: &ConnectionId) -> Result<ConnectionTestResult, ConnectionError> {
        let conn = self.get(id)?;
        let credentials = self.credentials(id).await?;

        let result = match conn.provider.as_str() {
            "openai" => self.probe_openai(&credentials).await,
            "gemini" => self.probe_gemini(&credentials).await,
            "claude" => self.probe_claude(&credentials).await,
            "slack" => self.probe_slack(&credentials).await,
            app => self.invoker.test_connection(app, credentials).await,
        };

        let mut updated = conn;
        updated.test_status = Some(if result.success {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        });
        updated.test_error = result.error.clone();
        updated.last_tested = Some(Utc::now());
        self.backend_put(updated)?;

        Ok(result)
    }

    async fn probe_openai(&self, credentials: &Value) -> ConnectionTestResult {
        let key = credentials.get("apiKey").and_then(Value::as_str).unwrap_or("");
        self.probe_get(
            "https://api.openai.com/v1/models",
            &[("Authorization", format!("Bearer {}", key))],
        )
        .await
    }

    async fn probe_gemini(&self, credentials: &Value) -> ConnectionTestResult {
        let key = credentials.get("apiKey").and_then(Value::as_str).unwrap_or("");
        self.probe_get(
            &format!(
                "https://generativelanguage.googleapis.com/v1beta/models?key={}",
                key
            ),
            &[],
        )
        .await
    }

    async fn probe_claude(&self, credentials: &Value) -> ConnectionTestResult {
        let key = credentials.get("apiKey").and_then(Value::as_str).unwrap_or("");
        self.probe_get(
            "https://api.anthropic.com/v1/models",
            &[
                ("x-api-key", key.to_string()),
                ("anthropic-version", "2023-06-01".to_string()),
            ],
        )
        .await
    }

    async fn probe_slack(&self, credentials: &Value) -> ConnectionTestResult {
        let token = credentials
            .get("accessToken")
            .or_else(|| credentials.get("token"))
            .and_then(Value::as_str)
            .unwrap_or("");
        self.probe_get(
            "https://slack.com/api/auth.test",
            &[("Authorization", format!("Bearer {}", token))],
        )
        .await
    }

    async fn probe_get(&self, url: &str, headers: &[(&str, String)]) -> ConnectionTestResult {
        let started = Instant::now();
        let mut request = self.http.get(url);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        match request.send().await {
            Ok(response) => {
                let elapsed = started.elapsed().as_millis() as u64;
                if response.status().is_success() {
                    ConnectionTestResult {
                        success: true,
                        message: "connection verified".to_string(),
                        response_time_ms: elapsed,
                        error: None,
                    }
                } else {
                    ConnectionTestResult {
                        success: false,
                        message: "provider rejected the credentials".to_string(),
                        response_time_ms: elapsed,
                        error: Some(format!("status {}", response.status())),
                    }
                }
            }
            Err(err) => ConnectionTestResult {
                success: false,
                message: "provider unreachable".to_string(),
                response_time_ms: started.elapsed().as_millis() as u64,
                error: Some(err.to_string()),
            },
        }
    }

    /// Issues a single-use scoped token. The bearer half is returned
    /// once; only its sha256 is stored.
    pub fn issue_scoped_token(
        &self,
        organization_id: OrganizationId,
        user_id: Option<UserId>,
        scope: impl Into<String>,
        step_id: Option<String>,
        ttl: Duration,
    ) -> Result<(String, ScopedToken), ConnectionError> {
        let mut raw = [0u8; 32];
        rand::rng().fill_bytes(&mut raw);
        let token = B64URL.encode(raw);

        let record = ScopedToken {
            id: TokenId::generate(),
            token_hash: sha256_hex(token.as_bytes()),
            scope: scope.into(),
            step_id,
            organization_id,
            user_id,
            expires_at: Utc::now() + ttl.max(Duration::seconds(60)),
            used_at: None,
            created_at: Utc::now(),
        };
        self.db.set(&handles::SCOPED_TOKENS, record.id, record.clone())?;
        Ok((token, record))
    }

    /// Consumes a scoped token: one atomic update sets `used_at` exactly
    /// once and returns the row.
    pub fn consume_scoped_token(&self, token: &str) -> Result<ScopedToken, ConnectionError> {
        let hash = sha256_hex(token.as_bytes());

        let candidate = self
            .db
            .collect_where(&handles::SCOPED_TOKENS, |_, t| t.token_hash == hash)?
            .into_iter()
            .next()
            .ok_or(ConnectionError::TokenUnknown)?;

        self.db
            .update(&handles::SCOPED_TOKENS, candidate.id, |slot| {
                let record = slot.as_mut().ok_or(ConnectionError::TokenUnknown)?;
                if record.used_at.is_some() {
                    return Err(ConnectionError::TokenConsumed);
                }
                if record.expires_at <= Utc::now() {
                    return Err(ConnectionError::TokenExpired);
                }
                record.used_at = Some(Utc::now());
                Ok(record.clone())
            })?
    }
}

/// Bridges the engine's credential seam onto the store.
pub struct StoreCredentialResolver(pub Arc<ConnectionStore>);

#[async_trait::async_trait]
impl CredentialResolver for StoreCredentialResolver {
    async fn resolve(&self, connection_id: &ConnectionId) -> Result<Option<Value>, EngineError> {
        match self.0.credentials(connection_id).await {
            Ok(credentials) => {
                let _ = self.0.mark_used(connection_id);
                Ok(Some(credentials))
            }
            Err(ConnectionError::NotFound(_)) => Ok(None),
            Err(err) => Err(EngineError::Credentials {
                node_id: flowline_types::NodeId::new("unknown").unwrap(),
                message: err.to_string(),
            }),
        }
    }
}
