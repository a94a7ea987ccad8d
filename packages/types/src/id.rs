use serde::{Deserialize, Deserializer, Serialize};
use std::{ops::Deref, str::FromStr};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Declares a UUID-v4 newtype id.
///
/// All tenant-scoped entities are keyed by one of these. Using distinct
/// types (instead of bare `Uuid`) keeps an execution id from ever being
/// passed where a workflow id is expected.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Serialize,
            Deserialize,
            Clone,
            Copy,
            Debug,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ToSchema,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Tenant id. The organization owns everything tenant-scoped.
    OrganizationId
);
uuid_id!(UserId);
uuid_id!(WorkflowId);
uuid_id!(VersionId);
uuid_id!(DeploymentId);
uuid_id!(ExecutionId);
uuid_id!(ConnectionId);
uuid_id!(PollingTriggerId);
uuid_id!(ScheduleTriggerId);
uuid_id!(TimerId);
uuid_id!(TokenId);
uuid_id!(EventId);

/// A node id inside a workflow graph. User-supplied, so strictly
/// validated: `[A-Za-z0-9_-]{1,64}`.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Validates without taking ownership - good for checking
    pub fn validate(id: impl AsRef<str>) -> Result<(), IdError> {
        let id = id.as_ref();

        if id.is_empty() || id.len() > 64 {
            Err(IdError::Length)
        } else if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            Err(IdError::Char)
        } else {
            Ok(())
        }
    }

    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();

        Self::validate(&id)?;

        Ok(Self(id))
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for NodeId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Public webhook endpoint id: the first 16 hex chars of
/// `md5(app_id|trigger_id|workflow_id|created_at)`. Stable across restarts
/// so registered URLs survive a redeploy.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
#[serde(transparent)]
pub struct WebhookId(String);

impl WebhookId {
    pub fn derive(
        app_id: &str,
        trigger_id: &str,
        workflow_id: &WorkflowId,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        use md5::{Digest, Md5};

        let mut hasher = Md5::new();
        hasher.update(
            format!(
                "{}|{}|{}|{}",
                app_id,
                trigger_id,
                workflow_id,
                created_at.timestamp_millis()
            )
            .as_bytes(),
        );
        let digest = const_hex::encode(hasher.finalize());
        Self(digest[..16].to_string())
    }

    pub fn validate(id: impl AsRef<str>) -> Result<(), IdError> {
        let id = id.as_ref();

        if id.len() != 16 {
            Err(IdError::Length)
        } else if !id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            Err(IdError::Char)
        } else {
            Ok(())
        }
    }

    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }
}

impl<'de> Deserialize<'de> for WebhookId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl AsRef<str> for WebhookId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WebhookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WebhookId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum IdError {
    #[error("id has an invalid length")]
    Length,
    #[error("id contains invalid characters")]
    Char,
}
