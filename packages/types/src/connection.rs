use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::{ConnectionId, OrganizationId, UserId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    ApiKey,
    OAuth,
    Basic,
    Custom,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// An encrypted credential record. The plaintext never touches this type:
/// `encrypted_credentials` is the base64 AES-GCM ciphertext+tag, `iv` the
/// base64 nonce, and the key columns say which key path can open it.
/// `(organization_id, user_id, provider, name)` is unique.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub organization_id: OrganizationId,
    pub user_id: UserId,
    pub provider: String,
    pub name: String,
    pub connection_type: ConnectionType,
    pub encrypted_credentials: String,
    pub iv: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_id: Option<String>,
    /// KMS-wrapped data key, present only when the record was sealed with
    /// a KMS-generated data key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_key_ciphertext: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_status: Option<TestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tested: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of probing a connection against its provider.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Masked export form: enough to inventory connections, never enough to
/// use them.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MaskedConnection {
    pub id: ConnectionId,
    pub provider: String,
    pub name: String,
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub metadata: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Connection> for MaskedConnection {
    fn from(conn: &Connection) -> Self {
        Self {
            id: conn.id,
            provider: conn.provider.clone(),
            name: conn.name.clone(),
            connection_type: conn.connection_type,
            metadata: conn.metadata.clone(),
            is_active: conn.is_active,
            created_at: conn.created_at,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecretAccessKind {
    Read,
    Write,
    Delete,
}

/// Lifecycle event emitted on every credential read/write. Carries labels
/// and correlation ids only, never secret material.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretAccessEvent {
    pub kind: SecretAccessKind,
    pub provider: String,
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub metadata: Value,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn masked_export_drops_ciphertext() {
        let conn = Connection {
            id: ConnectionId::generate(),
            organization_id: OrganizationId::generate(),
            user_id: UserId::generate(),
            provider: "slack".to_string(),
            name: "team-bot".to_string(),
            connection_type: ConnectionType::OAuth,
            encrypted_credentials: "AAAA".to_string(),
            iv: "BBBB".to_string(),
            encryption_key_id: None,
            data_key_ciphertext: None,
            metadata: json!({"scopes": ["chat:write"]}),
            test_status: None,
            test_error: None,
            last_tested: None,
            last_used: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let masked = MaskedConnection::from(&conn);
        let exported = serde_json::to_string(&masked).unwrap();
        assert!(!exported.contains("AAAA"));
        assert!(exported.contains("team-bot"));
    }
}
