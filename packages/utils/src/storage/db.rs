use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::anyhow;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::multiple::RefMulti;
use dashmap::DashMap;
use tracing::instrument;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    Organizations,
    Users,
    Memberships,
    Workflows,
    WorkflowVersions,
    WorkflowDeployments,
    Executions,
    NodeExecutions,
    NodeResults,
    Connections,
    ScopedTokens,
    ResumeTokens,
    Timers,
    WebhookTriggers,
    PollingTriggers,
    ScheduleTriggers,
    WebhookDedupe,
    WebhookEvents,
    VerificationFailures,
    ExecutionCounters,
    QuotaAudit,
    ConnectorAudit,
    EncryptionKeys,
    Test(&'static str),
}

impl Table {
    /// Every table the supervisor expects to be reachable at startup.
    pub const REQUIRED: &'static [Table] = &[
        Table::Organizations,
        Table::Workflows,
        Table::WorkflowVersions,
        Table::WorkflowDeployments,
        Table::Executions,
        Table::NodeExecutions,
        Table::NodeResults,
        Table::Connections,
        Table::ScopedTokens,
        Table::ResumeTokens,
        Table::Timers,
        Table::WebhookTriggers,
        Table::PollingTriggers,
        Table::WebhookDedupe,
        Table::ExecutionCounters,
        Table::QuotaAudit,
        Table::EncryptionKeys,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Organizations => "organizations",
            Table::Users => "users",
            Table::Memberships => "memberships",
            Table::Workflows => "workflows",
            Table::WorkflowVersions => "workflow_versions",
            Table::WorkflowDeployments => "workflow_deployments",
            Table::Executions => "executions",
            Table::NodeExecutions => "node_executions",
            Table::NodeResults => "node_execution_results",
            Table::Connections => "connections",
            Table::ScopedTokens => "scoped_tokens",
            Table::ResumeTokens => "resume_tokens",
            Table::Timers => "workflow_timers",
            Table::WebhookTriggers => "webhook_triggers",
            Table::PollingTriggers => "polling_triggers",
            Table::ScheduleTriggers => "schedule_triggers",
            Table::WebhookDedupe => "webhook_dedupe",
            Table::WebhookEvents => "webhook_events",
            Table::VerificationFailures => "webhook_verification_failures",
            Table::ExecutionCounters => "organization_execution_counters",
            Table::QuotaAudit => "organization_execution_quota_audit",
            Table::ConnectorAudit => "connector_entitlement_audit",
            Table::EncryptionKeys => "encryption_keys",
            Table::Test(name) => name,
        }
    }
}

pub struct TableHandle<K, V> {
    table: Table,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> Copy for TableHandle<K, V> {}

impl<K, V> Clone for TableHandle<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> TableHandle<K, V> {
    pub const fn new(table: Table) -> Self {
        Self {
            table,
            _marker: PhantomData,
        }
    }

    pub const fn table(&self) -> Table {
        self.table
    }
}

impl<K, V> fmt::Debug for TableHandle<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableHandle")
            .field("table", &self.table)
            .finish()
    }
}

pub mod handles {
    use super::{Table, TableHandle};
    use flowline_types::{
        Connection, ConnectionId, ConnectorAuditEvent, DeploymentId, EncryptionKey, EventId,
        Execution, ExecutionCounters, ExecutionId, Membership, NodeExecution,
        NodeExecutionResult, NodeId, Organization, OrganizationId, PollingTrigger,
        PollingTriggerId, QuotaAuditEvent, ResumeTokenRecord, ScheduleTrigger, ScheduleTriggerId,
        ScopedToken, TimerId, TokenId, User, UserId, VerificationFailure, VersionId,
        WebhookDedupe, WebhookEvent, WebhookId, WebhookTrigger, Workflow, WorkflowDeployment,
        WorkflowId, WorkflowTimer, WorkflowVersion,
    };

    pub const ORGANIZATIONS: TableHandle<OrganizationId, Organization> =
        TableHandle::new(Table::Organizations);
    pub const USERS: TableHandle<UserId, User> = TableHandle::new(Table::Users);
    pub const MEMBERSHIPS: TableHandle<(UserId, OrganizationId), Membership> =
        TableHandle::new(Table::Memberships);
    pub const WORKFLOWS: TableHandle<WorkflowId, Workflow> = TableHandle::new(Table::Workflows);
    pub const WORKFLOW_VERSIONS: TableHandle<VersionId, WorkflowVersion> =
        TableHandle::new(Table::WorkflowVersions);
    pub const WORKFLOW_DEPLOYMENTS: TableHandle<DeploymentId, WorkflowDeployment> =
        TableHandle::new(Table::WorkflowDeployments);
    pub const EXECUTIONS: TableHandle<ExecutionId, Execution> = TableHandle::new(Table::Executions);
    pub const NODE_EXECUTIONS: TableHandle<(ExecutionId, NodeId, u32), NodeExecution> =
        TableHandle::new(Table::NodeExecutions);
    pub const NODE_RESULTS: TableHandle<(ExecutionId, NodeId, String), NodeExecutionResult> =
        TableHandle::new(Table::NodeResults);
    pub const CONNECTIONS: TableHandle<ConnectionId, Connection> =
        TableHandle::new(Table::Connections);
    pub const SCOPED_TOKENS: TableHandle<TokenId, ScopedToken> =
        TableHandle::new(Table::ScopedTokens);
    pub const RESUME_TOKENS: TableHandle<TokenId, ResumeTokenRecord> =
        TableHandle::new(Table::ResumeTokens);
    pub const TIMERS: TableHandle<TimerId, WorkflowTimer> = TableHandle::new(Table::Timers);
    pub const WEBHOOK_TRIGGERS: TableHandle<WebhookId, WebhookTrigger> =
        TableHandle::new(Table::WebhookTriggers);
    pub const POLLING_TRIGGERS: TableHandle<PollingTriggerId, PollingTrigger> =
        TableHandle::new(Table::PollingTriggers);
    pub const SCHEDULE_TRIGGERS: TableHandle<ScheduleTriggerId, ScheduleTrigger> =
        TableHandle::new(Table::ScheduleTriggers);
    pub const WEBHOOK_DEDUPE: TableHandle<(WebhookId, String), WebhookDedupe> =
        TableHandle::new(Table::WebhookDedupe);
    pub const WEBHOOK_EVENTS: TableHandle<EventId, WebhookEvent> =
        TableHandle::new(Table::WebhookEvents);
    pub const VERIFICATION_FAILURES: TableHandle<EventId, VerificationFailure> =
        TableHandle::new(Table::VerificationFailures);
    pub const EXECUTION_COUNTERS: TableHandle<OrganizationId, ExecutionCounters> =
        TableHandle::new(Table::ExecutionCounters);
    pub const QUOTA_AUDIT: TableHandle<EventId, QuotaAuditEvent> =
        TableHandle::new(Table::QuotaAudit);
    pub const CONNECTOR_AUDIT: TableHandle<EventId, ConnectorAuditEvent> =
        TableHandle::new(Table::ConnectorAudit);
    pub const ENCRYPTION_KEYS: TableHandle<String, EncryptionKey> =
        TableHandle::new(Table::EncryptionKeys);
}

pub type DBError = anyhow::Error;

type AnyMap = Arc<dyn Any + Send + Sync>;

/// Typed-table store shared by every repository. Tables are created
/// lazily on first touch; each table is a concurrent map, and `update`
/// gives entry-level read-modify-write atomicity, which is what the
/// counters, deployments, tokens and timers rely on for their
/// "row lock" semantics.
#[derive(Clone, Default)]
pub struct CoreDb {
    tables: Arc<DashMap<Table, AnyMap>>,
}

impl CoreDb {
    #[instrument(fields(subsys = "CoreDb"))]
    pub fn new() -> Result<Self, DBError> {
        Ok(Self {
            tables: Arc::new(DashMap::new()),
        })
    }

    #[instrument(skip(self, key, value), fields(subsys = "CoreDb", table = ?handle.table()))]
    pub fn set<K, V>(&self, handle: &TableHandle<K, V>, key: K, value: V) -> Result<(), DBError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let map = self.table_map(handle)?;
        map.insert(key, value);
        Ok(())
    }

    #[instrument(skip(self, key), fields(subsys = "CoreDb", table = ?handle.table()))]
    pub fn get<K, V>(&self, handle: &TableHandle<K, V>, key: &K) -> Result<Option<V>, DBError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let map = self.table_map(handle)?;
        Ok(map.get(key).map(|v| v.clone()))
    }

    #[instrument(skip(self, key), fields(subsys = "CoreDb", table = ?handle.table()))]
    pub fn remove<K, V>(&self, handle: &TableHandle<K, V>, key: &K) -> Result<Option<V>, DBError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let map = self.table_map(handle)?;
        Ok(map.remove(key).map(|(_, v)| v))
    }

    #[instrument(skip(self, key), fields(subsys = "CoreDb", table = ?handle.table()))]
    pub fn contains_key<K, V>(&self, handle: &TableHandle<K, V>, key: &K) -> Result<bool, DBError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let map = self.table_map(handle)?;
        Ok(map.contains_key(key))
    }

    /// Atomic read-modify-write on one entry. The closure sees the current
    /// value (None when absent) and may replace, mutate, or delete it by
    /// leaving the slot None; nothing else can touch the entry while the
    /// closure runs. This is the row-lock primitive the admission
    /// counters, token consumes and timer claims are built on.
    #[instrument(skip(self, key, f), fields(subsys = "CoreDb", table = ?handle.table()))]
    pub fn update<K, V, R>(
        &self,
        handle: &TableHandle<K, V>,
        key: K,
        f: impl FnOnce(&mut Option<V>) -> R,
    ) -> Result<R, DBError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let map = self.table_map(handle)?;
        let result = match map.entry(key) {
            Entry::Occupied(mut occupied) => {
                let mut slot = Some(occupied.get().clone());
                let result = f(&mut slot);
                match slot {
                    Some(value) => {
                        occupied.insert(value);
                    }
                    None => {
                        occupied.remove();
                    }
                }
                result
            }
            Entry::Vacant(vacant) => {
                let mut slot = None;
                let result = f(&mut slot);
                if let Some(value) = slot {
                    vacant.insert(value);
                }
                result
            }
        };
        Ok(result)
    }

    #[instrument(skip(self), fields(subsys = "CoreDb", table = ?handle.table()))]
    pub fn clear_table<K, V>(&self, handle: &TableHandle<K, V>) -> Result<(), DBError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let map = self.table_map(handle)?;
        map.clear();
        Ok(())
    }

    #[instrument(skip(self, f), fields(subsys = "CoreDb", table = ?handle.table()))]
    pub fn with_table_read<K, V, F, R>(
        &self,
        handle: &TableHandle<K, V>,
        f: F,
    ) -> Result<R, DBError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: FnOnce(&TableReadGuard<K, V>) -> Result<R, DBError>,
    {
        let map = self.table_map(handle)?;
        let guard = TableReadGuard { map };
        f(&guard)
    }

    /// Collects the values matching a predicate. Convenience over
    /// `with_table_read` for the common list-with-filter shape.
    pub fn collect_where<K, V>(
        &self,
        handle: &TableHandle<K, V>,
        mut pred: impl FnMut(&K, &V) -> bool,
    ) -> Result<Vec<V>, DBError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        self.with_table_read(handle, |table| {
            let mut out = Vec::new();
            for entry in table.iter() {
                let (key, value) = entry.pair();
                if pred(key, value) {
                    out.push(value.clone());
                }
            }
            Ok(out)
        })
    }

    pub fn len<K, V>(&self, handle: &TableHandle<K, V>) -> Result<usize, DBError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let map = self.table_map(handle)?;
        Ok(map.len())
    }

    fn table_map<K, V>(&self, handle: &TableHandle<K, V>) -> Result<Arc<DashMap<K, V>>, DBError>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        match self.tables.entry(handle.table()) {
            Entry::Occupied(entry) => {
                let existing = entry.get().clone();
                existing
                    .downcast::<DashMap<K, V>>()
                    .map_err(|_| anyhow!("table {:?} type mismatch", handle.table()))
            }
            Entry::Vacant(entry) => {
                let map: Arc<DashMap<K, V>> = Arc::new(DashMap::new());
                let erased: AnyMap = map.clone();
                entry.insert(erased);
                Ok(map)
            }
        }
    }
}

pub struct TableReadGuard<K, V> {
    map: Arc<DashMap<K, V>>,
}

impl<K, V> TableReadGuard<K, V>
where
    K: Eq + Hash,
{
    pub fn iter(&self) -> TableIter<'_, K, V> {
        TableIter {
            inner: self.map.iter(),
        }
    }
}

pub struct TableIter<'a, K, V> {
    inner: dashmap::iter::Iter<'a, K, V>,
}

impl<'a, K, V> Iterator for TableIter<'a, K, V>
where
    K: Eq + Hash,
{
    type Item = TableEntry<'a, K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(TableEntry)
    }
}

pub struct TableEntry<'a, K, V>(RefMulti<'a, K, V>);

impl<'a, K, V> TableEntry<'a, K, V>
where
    K: Eq + Hash,
{
    pub fn pair(&self) -> (&K, &V) {
        (self.0.key(), self.0.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct TestStruct {
        name: String,
        value: i32,
    }

    #[test]
    fn set_get_round_trip() {
        let db = CoreDb::new().unwrap();
        let handle: TableHandle<u32, TestStruct> =
            TableHandle::new(Table::Test("test_u32_teststruct"));
        let key = 7u32;
        let value = TestStruct {
            name: "demo".to_string(),
            value: 99,
        };

        assert!(db.get(&handle, &key).unwrap().is_none());
        db.set(&handle, key, value.clone()).unwrap();
        assert_eq!(db.get(&handle, &key).unwrap(), Some(value));
    }

    #[test]
    fn update_inserts_mutates_and_deletes() {
        let db = CoreDb::new().unwrap();
        let handle: TableHandle<String, i64> = TableHandle::new(Table::Test("test_update"));
        let key = "counter".to_string();

        // insert through the vacant path
        db.update(&handle, key.clone(), |slot| {
            assert!(slot.is_none());
            *slot = Some(1);
        })
        .unwrap();
        assert_eq!(db.get(&handle, &key).unwrap(), Some(1));

        // mutate in place
        let seen = db
            .update(&handle, key.clone(), |slot| {
                let value = slot.as_mut().unwrap();
                *value += 41;
                *value
            })
            .unwrap();
        assert_eq!(seen, 42);

        // delete by clearing the slot
        db.update(&handle, key.clone(), |slot| {
            *slot = None;
        })
        .unwrap();
        assert!(db.get(&handle, &key).unwrap().is_none());
    }

    #[test]
    fn update_is_atomic_across_threads() {
        let db = CoreDb::new().unwrap();
        let handle: TableHandle<String, i64> = TableHandle::new(Table::Test("test_atomic"));
        let key = "shared".to_string();
        db.set(&handle, key.clone(), 0).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        db.update(&handle, key.clone(), |slot| {
                            *slot = Some(slot.unwrap() + 1);
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(db.get(&handle, &key).unwrap(), Some(800));
    }

    #[test]
    fn collect_where_filters() {
        let db = CoreDb::new().unwrap();
        let handle: TableHandle<String, TestStruct> =
            TableHandle::new(Table::Test("test_collect"));
        for (name, value) in [("alpha", 1), ("beta", 2), ("gamma", 3)] {
            db.set(
                &handle,
                name.to_string(),
                TestStruct {
                    name: name.to_string(),
                    value,
                },
            )
            .unwrap();
        }

        let mut odd = db.collect_where(&handle, |_, v| v.value % 2 == 1).unwrap();
        odd.sort_by_key(|v| v.value);
        assert_eq!(odd.len(), 2);
        assert_eq!(odd[0].name, "alpha");
        assert_eq!(odd[1].name, "gamma");
    }
}
