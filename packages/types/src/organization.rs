use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::{EventId, OrganizationId, UserId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrgStatus {
    Active,
    Suspended,
    Trial,
    Churned,
}

/// Plan limits enforced by admission and the repositories. A zero limit
/// means the plan does not include the feature at all.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    pub max_workflows: u32,
    pub max_executions: u64,
    pub max_users: u32,
    pub max_storage_bytes: u64,
    pub max_concurrent_executions: u32,
    pub max_executions_per_minute: u32,
}

impl Default for PlanLimits {
    fn default() -> Self {
        // trial plan, assigned at signup
        Self {
            max_workflows: 10,
            max_executions: 1_000,
            max_users: 5,
            max_storage_bytes: 512 * 1024 * 1024,
            max_concurrent_executions: 2,
            max_executions_per_minute: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySettings {
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub allowed_ip_ranges: Vec<String>,
    #[serde(default)]
    pub mfa_required: bool,
    pub session_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_rotation_days: Option<u32>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            allowed_ip_ranges: Vec::new(),
            mfa_required: false,
            session_timeout_secs: 8 * 60 * 60,
            password_policy: None,
            api_key_rotation_days: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounters {
    pub executions_total: u64,
    pub api_calls_total: u64,
    pub tokens_total: u64,
    pub storage_bytes: u64,
}

/// The tenant. Never destroyed; lifecycle is tracked by `status`.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    pub status: OrgStatus,
    pub plan: PlanLimits,
    pub security: SecuritySettings,
    #[serde(default)]
    pub usage: UsageCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    /// Auto-provisioned trial tenant, as created at signup.
    pub fn provision_trial(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: OrganizationId::generate(),
            name: name.into(),
            status: OrgStatus::Trial,
            plan: PlanLimits::default(),
            security: SecuritySettings::default(),
            usage: UsageCounters::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

/// Per-organization membership. A user belongs to at least one
/// organization; exactly one membership is the default.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub role: Role,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Live admission counters for one organization. Always read-modify-
/// written under the row lock; the fixed 60-second window rolls over when
/// `now - window_start` exceeds a minute.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCounters {
    pub running_executions: u32,
    pub window_start: DateTime<Utc>,
    pub executions_in_window: u32,
}

impl ExecutionCounters {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            running_executions: 0,
            window_start: now,
            executions_in_window: 0,
        }
    }
}

/// Append-only admission audit row. Rows are never modified.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuotaAuditEvent {
    pub id: EventId,
    pub organization_id: OrganizationId,
    pub event_type: String,
    pub limit_value: u64,
    pub observed_value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorAuditAction {
    Enabled,
    Disabled,
}

/// Append-only connector entitlement audit row.
#[derive(Serialize, Deserialize, Clone, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorAuditEvent {
    pub id: EventId,
    pub organization_id: OrganizationId,
    pub connector: String,
    pub action: ConnectorAuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performed_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}
