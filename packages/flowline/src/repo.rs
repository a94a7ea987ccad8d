use chrono::Utc;
use flowline_types::{
    diff_graphs_with, DeploymentId, Environment, EnvironmentDeployment, EnvironmentsSummary,
    Graph, GraphError, OrganizationId, UserId, VersionHistory, VersionId, VersionState, Workflow,
    WorkflowDeployment, WorkflowDiffSummary, WorkflowId, WorkflowVersion,
};
use serde_json::Value;
use thiserror::Error;
use tracing::instrument;
use utils::storage::db::{handles, CoreDb, DBError};

/// Workflow, version and deployment repository. Owns the promotion rules:
/// published versions are immutable, only staged versions reach
/// production (unless explicitly overridden), and every promotion writes
/// a fresh deployment row while deactivating its predecessor.
#[derive(Clone)]
pub struct WorkflowRepo {
    db: CoreDb,
}

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    #[error("version {0} not found")]
    VersionNotFound(VersionId),

    #[error("version {0} does not belong to this workflow")]
    VersionWorkflowMismatch(VersionId),

    #[error("version {0} is already published")]
    AlreadyPublished(VersionId),

    #[error("version {0} is a draft; publish it before promoting to test")]
    NotPublished(VersionId),

    #[error("version {0} is not active in test; stage it first or set allowNonStagedProd")]
    NotStaged(VersionId),

    #[error("promotion has unresolved breaking changes")]
    BreakingChanges(Box<WorkflowDiffSummary>),

    #[error("graph: {0}")]
    Graph(#[from] GraphError),

    #[error("db: {0}")]
    Db(#[from] DBError),
}

impl WorkflowRepo {
    pub fn new(db: CoreDb) -> Self {
        Self { db }
    }

    pub fn create_workflow(
        &self,
        organization_id: OrganizationId,
        name: impl Into<String>,
        graph: Graph,
    ) -> Result<Workflow, RepoError> {
        let now = Utc::now();
        let workflow = Workflow {
            id: WorkflowId::generate(),
            organization_id,
            name: name.into(),
            description: None,
            graph,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.db
            .set(&handles::WORKFLOWS, workflow.id, workflow.clone())?;
        Ok(workflow)
    }

    pub fn get_workflow(&self, id: &WorkflowId) -> Result<Workflow, RepoError> {
        self.db
            .get(&handles::WORKFLOWS, id)?
            .filter(|w| w.is_active)
            .ok_or(RepoError::WorkflowNotFound(*id))
    }

    pub fn list_workflows(&self, organization_id: &OrganizationId) -> Result<Vec<Workflow>, RepoError> {
        Ok(self.db.collect_where(&handles::WORKFLOWS, |_, w| {
            w.organization_id == *organization_id && w.is_active
        })?)
    }

    /// Updates the editable graph on the workflow container. Versions are
    /// untouched; this is the draft surface snapshots are taken from.
    pub fn update_graph(&self, id: &WorkflowId, graph: Graph) -> Result<Workflow, RepoError> {
        self.db
            .update(&handles::WORKFLOWS, *id, |slot| match slot.as_mut() {
                Some(workflow) if workflow.is_active => {
                    workflow.graph = graph;
                    workflow.updated_at = Utc::now();
                    Ok(workflow.clone())
                }
                _ => Err(RepoError::WorkflowNotFound(*id)),
            })?
    }

    pub fn soft_delete_workflow(&self, id: &WorkflowId) -> Result<(), RepoError> {
        self.db
            .update(&handles::WORKFLOWS, *id, |slot| match slot.as_mut() {
                Some(workflow) => {
                    workflow.is_active = false;
                    workflow.updated_at = Utc::now();
                    Ok(())
                }
                None => Err(RepoError::WorkflowNotFound(*id)),
            })?
    }

    /// Snapshots the workflow's current graph as the next draft version.
    /// Versions are append-only; the number is one past the highest seen.
    #[instrument(level = "debug", skip(self, metadata), fields(subsys = "WorkflowRepo"))]
    pub fn create_version(
        &self,
        workflow_id: &WorkflowId,
        metadata: Value,
        created_by: Option<UserId>,
    ) -> Result<WorkflowVersion, RepoError> {
        let workflow = self.get_workflow(workflow_id)?;

        let next_number = self
            .list_versions(workflow_id)?
            .iter()
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1;

        let version = WorkflowVersion {
            id: VersionId::generate(),
            workflow_id: *workflow_id,
            version_number: next_number,
            state: VersionState::Draft,
            graph: workflow.graph,
            metadata,
            created_at: Utc::now(),
            created_by,
            published_at: None,
            published_by: None,
        };
        self.db
            .set(&handles::WORKFLOW_VERSIONS, version.id, version.clone())?;
        Ok(version)
    }

    pub fn get_version(&self, id: &VersionId) -> Result<WorkflowVersion, RepoError> {
        self.db
            .get(&handles::WORKFLOW_VERSIONS, id)?
            .ok_or(RepoError::VersionNotFound(*id))
    }

    pub fn list_versions(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowVersion>, RepoError> {
        let mut versions = self
            .db
            .collect_where(&handles::WORKFLOW_VERSIONS, |_, v| {
                v.workflow_id == *workflow_id
            })?;
        versions.sort_by_key(|v| v.version_number);
        Ok(versions)
    }

    /// Draft → published, exactly once. The graph is validated here so
    /// nothing structurally broken can ever be deployed.
    #[instrument(level = "debug", skip(self), fields(subsys = "WorkflowRepo"))]
    pub fn publish_version(
        &self,
        id: &VersionId,
        published_by: Option<UserId>,
    ) -> Result<WorkflowVersion, RepoError> {
        let version = self.get_version(id)?;
        version.graph.validate()?;

        self.db
            .update(&handles::WORKFLOW_VERSIONS, *id, |slot| {
                match slot.as_mut() {
                    Some(version) => {
                        if version.state == VersionState::Published {
                            return Err(RepoError::AlreadyPublished(*id));
                        }
                        version.state = VersionState::Published;
                        version.published_at = Some(Utc::now());
                        version.published_by = published_by;
                        Ok(version.clone())
                    }
                    None => Err(RepoError::VersionNotFound(*id)),
                }
            })?
    }

    pub fn list_deployments(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Vec<WorkflowDeployment>, RepoError> {
        let mut deployments = self
            .db
            .collect_where(&handles::WORKFLOW_DEPLOYMENTS, |_, d| {
                d.workflow_id == *workflow_id
            })?;
        deployments.sort_by_key(|d| d.deployed_at);
        Ok(deployments)
    }

    pub fn active_deployment(
        &self,
        workflow_id: &WorkflowId,
        environment: Environment,
    ) -> Result<Option<WorkflowDeployment>, RepoError> {
        Ok(self
            .db
            .collect_where(&handles::WORKFLOW_DEPLOYMENTS, |_, d| {
                d.workflow_id == *workflow_id && d.environment == environment && d.is_active
            })?
            .into_iter()
            .next())
    }

    /// The graph currently live in an environment: the deployed version's
    /// graph, or the workflow's editable graph for `draft`.
    pub fn resolve_graph(
        &self,
        workflow_id: &WorkflowId,
        environment: Environment,
    ) -> Result<(Option<VersionId>, Graph), RepoError> {
        if let Some(deployment) = self.active_deployment(workflow_id, environment)? {
            let version = self.get_version(&deployment.version_id)?;
            return Ok((Some(version.id), version.graph));
        }
        if environment == Environment::Draft {
            return Ok((None, self.get_workflow(workflow_id)?.graph));
        }
        // fall through the environment chain: production falls back to
        // test, test to draft
        match environment {
            Environment::Production => self.resolve_graph(workflow_id, Environment::Test),
            Environment::Test => self.resolve_graph(workflow_id, Environment::Draft),
            Environment::Draft => unreachable!("handled above"),
        }
    }

    /// Diffs a candidate version against what is currently active in the
    /// target environment. `provider_of` lets a connection swap within
    /// the same provider avoid the breaking classification.
    pub fn validate(
        &self,
        workflow_id: &WorkflowId,
        version_id: &VersionId,
        target: Environment,
        provider_of: impl Fn(&flowline_types::ConnectionId) -> Option<String>,
    ) -> Result<WorkflowDiffSummary, RepoError> {
        let candidate = self.get_version(version_id)?;
        if candidate.workflow_id != *workflow_id {
            return Err(RepoError::VersionWorkflowMismatch(*version_id));
        }

        let (current_graph, current_meta) = match self.active_deployment(workflow_id, target)? {
            Some(deployment) => {
                let current = self.get_version(&deployment.version_id)?;
                (current.graph, current.metadata)
            }
            None => (Graph::default(), Value::Null),
        };

        Ok(diff_graphs_with(
            &current_graph,
            &current_meta,
            &candidate.graph,
            &candidate.metadata,
            provider_of,
        ))
    }

    /// Promotion: test requires a published version; production requires
    /// the version to be active in test unless `allow_non_staged_prod`.
    /// Unacknowledged breaking changes reject. Re-promoting the active
    /// version is a no-op returning the existing row.
    #[instrument(level = "debug", skip(self, provider_of), fields(subsys = "WorkflowRepo"))]
    #[allow(clippy::too_many_arguments)]
    pub fn promote(
        &self,
        workflow_id: &WorkflowId,
        version_id: &VersionId,
        target: Environment,
        acknowledge_breaking: bool,
        allow_non_staged_prod: bool,
        deployed_by: Option<UserId>,
        provider_of: impl Fn(&flowline_types::ConnectionId) -> Option<String>,
    ) -> Result<WorkflowDeployment, RepoError> {
        let version = self.get_version(version_id)?;
        if version.workflow_id != *workflow_id {
            return Err(RepoError::VersionWorkflowMismatch(*version_id));
        }

        match target {
            Environment::Draft => {}
            Environment::Test => {
                if !version.is_published() {
                    return Err(RepoError::NotPublished(*version_id));
                }
            }
            Environment::Production => {
                if !version.is_published() {
                    return Err(RepoError::NotPublished(*version_id));
                }
                let staged = self
                    .active_deployment(workflow_id, Environment::Test)?
                    .map(|d| d.version_id == *version_id)
                    .unwrap_or(false);
                if !staged && !allow_non_staged_prod {
                    return Err(RepoError::NotStaged(*version_id));
                }
            }
        }

        let previous = self.active_deployment(workflow_id, target)?;
        if let Some(previous) = &previous {
            // promoting the already-active version is a no-op
            if previous.version_id == *version_id {
                return Ok(previous.clone());
            }
        }

        let diff = self.validate(workflow_id, version_id, target, provider_of)?;
        if diff.is_breaking() && !acknowledge_breaking {
            return Err(RepoError::BreakingChanges(Box::new(diff)));
        }

        self.swap_active(workflow_id, target, *version_id, deployed_by, None, previous)
    }

    /// Rollback: deploy a previously deployed version, recording which
    /// deployment row it supersedes. Staging rules do not apply; the
    /// version has been live before.
    #[instrument(level = "debug", skip(self), fields(subsys = "WorkflowRepo"))]
    pub fn rollback(
        &self,
        workflow_id: &WorkflowId,
        target: Environment,
        version_id: &VersionId,
        deployed_by: Option<UserId>,
    ) -> Result<WorkflowDeployment, RepoError> {
        let version = self.get_version(version_id)?;
        if version.workflow_id != *workflow_id {
            return Err(RepoError::VersionWorkflowMismatch(*version_id));
        }

        let previous = self.active_deployment(workflow_id, target)?;
        let rollback_of = previous.as_ref().map(|d| d.id);
        self.swap_active(
            workflow_id,
            target,
            *version_id,
            deployed_by,
            rollback_of,
            previous,
        )
    }

    fn swap_active(
        &self,
        workflow_id: &WorkflowId,
        target: Environment,
        version_id: VersionId,
        deployed_by: Option<UserId>,
        rollback_of: Option<DeploymentId>,
        previous: Option<WorkflowDeployment>,
    ) -> Result<WorkflowDeployment, RepoError> {
        if let Some(previous) = previous {
            self.db
                .update(&handles::WORKFLOW_DEPLOYMENTS, previous.id, |slot| {
                    if let Some(deployment) = slot.as_mut() {
                        deployment.is_active = false;
                    }
                })?;
        }

        let deployment = WorkflowDeployment {
            id: DeploymentId::generate(),
            workflow_id: *workflow_id,
            environment: target,
            version_id,
            deployed_at: Utc::now(),
            deployed_by,
            rollback_of,
            is_active: true,
        };
        self.db
            .set(&handles::WORKFLOW_DEPLOYMENTS, deployment.id, deployment.clone())?;

        tracing::info!(
            workflow_id = %workflow_id,
            version_id = %version_id,
            environment = %target,
            rollback = rollback_of.is_some(),
            "deployment activated"
        );

        Ok(deployment)
    }

    /// The versions listing payload: all versions, all deployments, and
    /// the active pair per environment.
    pub fn version_history(&self, workflow_id: &WorkflowId) -> Result<VersionHistory, RepoError> {
        let versions = self.list_versions(workflow_id)?;
        let deployments = self.list_deployments(workflow_id)?;

        let summary = |environment: Environment| -> Result<EnvironmentDeployment, RepoError> {
            let active = self.active_deployment(workflow_id, environment)?;
            let version = match &active {
                Some(deployment) => Some(self.get_version(&deployment.version_id)?),
                None => None,
            };
            Ok(EnvironmentDeployment {
                active_deployment: active,
                version,
            })
        };

        Ok(VersionHistory {
            versions,
            deployments,
            environments: EnvironmentsSummary {
                draft: summary(Environment::Draft)?,
                test: summary(Environment::Test)?,
                production: summary(Environment::Production)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::{Edge, Node, NodeId, NodeKind};
    use serde_json::json;

    fn graph() -> Graph {
        Graph {
            nodes: vec![
                Node {
                    id: NodeId::new("start").unwrap(),
                    kind: NodeKind::Trigger,
                    app: "slack".to_string(),
                    op: "message".to_string(),
                    params: json!({}),
                    connection_id: None,
                },
                Node {
                    id: NodeId::new("notify").unwrap(),
                    kind: NodeKind::Action,
                    app: "slack".to_string(),
                    op: "post".to_string(),
                    params: json!({"channel": "#general"}),
                    connection_id: None,
                },
            ],
            edges: vec![Edge {
                id: None,
                from: NodeId::new("start").unwrap(),
                to: NodeId::new("notify").unwrap(),
            }],
        }
    }

    fn repo() -> WorkflowRepo {
        WorkflowRepo::new(CoreDb::new().unwrap())
    }

    fn no_providers(_: &flowline_types::ConnectionId) -> Option<String> {
        None
    }

    #[test]
    fn version_numbers_are_sequential() {
        let repo = repo();
        let workflow = repo
            .create_workflow(OrganizationId::generate(), "wf", graph())
            .unwrap();

        let v1 = repo.create_version(&workflow.id, json!({}), None).unwrap();
        let v2 = repo.create_version(&workflow.id, json!({}), None).unwrap();
        assert_eq!(v1.version_number, 1);
        assert_eq!(v2.version_number, 2);
    }

    #[test]
    fn publish_happens_exactly_once() {
        let repo = repo();
        let workflow = repo
            .create_workflow(OrganizationId::generate(), "wf", graph())
            .unwrap();
        let version = repo.create_version(&workflow.id, json!({}), None).unwrap();

        let published = repo.publish_version(&version.id, None).unwrap();
        assert!(published.published_at.is_some());

        assert!(matches!(
            repo.publish_version(&version.id, None),
            Err(RepoError::AlreadyPublished(_))
        ));
    }

    #[test]
    fn published_version_graph_is_immutable() {
        let repo = repo();
        let workflow = repo
            .create_workflow(OrganizationId::generate(), "wf", graph())
            .unwrap();
        let version = repo.create_version(&workflow.id, json!({}), None).unwrap();
        repo.publish_version(&version.id, None).unwrap();

        // mutating the workflow's editable graph does not touch the snapshot
        let mut changed = graph();
        changed.nodes[1].params = json!({"channel": "#alerts"});
        repo.update_graph(&workflow.id, changed).unwrap();

        let reloaded = repo.get_version(&version.id).unwrap();
        assert_eq!(
            reloaded.graph.nodes[1].params,
            json!({"channel": "#general"})
        );
    }

    #[test]
    fn invalid_graph_cannot_publish() {
        let repo = repo();
        let mut bad = graph();
        bad.edges.push(Edge {
            id: None,
            from: NodeId::new("notify").unwrap(),
            to: NodeId::new("start").unwrap(),
        });
        let workflow = repo
            .create_workflow(OrganizationId::generate(), "wf", bad)
            .unwrap();
        let version = repo.create_version(&workflow.id, json!({}), None).unwrap();

        assert!(matches!(
            repo.publish_version(&version.id, None),
            Err(RepoError::Graph(GraphError::Cycle))
        ));
    }

    #[test]
    fn promotion_requires_staging_for_production() {
        let repo = repo();
        let workflow = repo
            .create_workflow(OrganizationId::generate(), "wf", graph())
            .unwrap();
        let version = repo.create_version(&workflow.id, json!({}), None).unwrap();

        // draft cannot go to test
        assert!(matches!(
            repo.promote(&workflow.id, &version.id, Environment::Test, false, false, None, no_providers),
            Err(RepoError::NotPublished(_))
        ));

        repo.publish_version(&version.id, None).unwrap();

        // published but not staged cannot go straight to production
        assert!(matches!(
            repo.promote(&workflow.id, &version.id, Environment::Production, false, false, None, no_providers),
            Err(RepoError::NotStaged(_))
        ));

        // the override allows it
        repo.promote(
            &workflow.id,
            &version.id,
            Environment::Production,
            false,
            true,
            None,
            no_providers,
        )
        .unwrap();

        // the staged path also works
        let v2 = repo.create_version(&workflow.id, json!({}), None).unwrap();
        repo.publish_version(&v2.id, None).unwrap();
        repo.promote(&workflow.id, &v2.id, Environment::Test, true, false, None, no_providers)
            .unwrap();
        repo.promote(
            &workflow.id,
            &v2.id,
            Environment::Production,
            true,
            false,
            None,
            no_providers,
        )
        .unwrap();
    }

    #[test]
    fn promotion_swaps_active_and_repromotion_is_noop() {
        let repo = repo();
        let workflow = repo
            .create_workflow(OrganizationId::generate(), "wf", graph())
            .unwrap();

        let v1 = repo.create_version(&workflow.id, json!({}), None).unwrap();
        repo.publish_version(&v1.id, None).unwrap();
        let d1 = repo
            .promote(&workflow.id, &v1.id, Environment::Test, false, false, None, no_providers)
            .unwrap();

        // same version again: no new row
        let d1_again = repo
            .promote(&workflow.id, &v1.id, Environment::Test, false, false, None, no_providers)
            .unwrap();
        assert_eq!(d1.id, d1_again.id);

        let v2 = repo.create_version(&workflow.id, json!({}), None).unwrap();
        repo.publish_version(&v2.id, None).unwrap();
        let d2 = repo
            .promote(&workflow.id, &v2.id, Environment::Test, true, false, None, no_providers)
            .unwrap();
        assert_ne!(d1.id, d2.id);

        // exactly one active deployment per environment
        let active: Vec<_> = repo
            .list_deployments(&workflow.id)
            .unwrap()
            .into_iter()
            .filter(|d| d.environment == Environment::Test && d.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].version_id, v2.id);
    }

    #[test]
    fn breaking_changes_require_acknowledgement() {
        let repo = repo();
        let workflow = repo
            .create_workflow(OrganizationId::generate(), "wf", graph())
            .unwrap();

        let v1 = repo.create_version(&workflow.id, json!({}), None).unwrap();
        repo.publish_version(&v1.id, None).unwrap();
        repo.promote(&workflow.id, &v1.id, Environment::Test, false, false, None, no_providers)
            .unwrap();

        // drop the notify node: breaking vs the active test deployment
        let mut changed = graph();
        changed.nodes.pop();
        changed.edges.pop();
        repo.update_graph(&workflow.id, changed).unwrap();
        let v2 = repo.create_version(&workflow.id, json!({}), None).unwrap();
        repo.publish_version(&v2.id, None).unwrap();

        let err = repo
            .promote(&workflow.id, &v2.id, Environment::Test, false, false, None, no_providers)
            .unwrap_err();
        assert!(matches!(err, RepoError::BreakingChanges(_)));

        repo.promote(&workflow.id, &v2.id, Environment::Test, true, false, None, no_providers)
            .unwrap();
    }

    #[test]
    fn rollback_links_superseded_deployment() {
        let repo = repo();
        let workflow = repo
            .create_workflow(OrganizationId::generate(), "wf", graph())
            .unwrap();

        let v1 = repo.create_version(&workflow.id, json!({}), None).unwrap();
        repo.publish_version(&v1.id, None).unwrap();
        repo.promote(&workflow.id, &v1.id, Environment::Test, false, false, None, no_providers)
            .unwrap();

        let v2 = repo.create_version(&workflow.id, json!({}), None).unwrap();
        repo.publish_version(&v2.id, None).unwrap();
        let d2 = repo
            .promote(&workflow.id, &v2.id, Environment::Test, true, false, None, no_providers)
            .unwrap();

        let rollback = repo
            .rollback(&workflow.id, Environment::Test, &v1.id, None)
            .unwrap();
        assert_eq!(rollback.rollback_of, Some(d2.id));
        assert_eq!(rollback.version_id, v1.id);

        let active = repo
            .active_deployment(&workflow.id, Environment::Test)
            .unwrap()
            .unwrap();
        assert_eq!(active.id, rollback.id);
    }

    #[test]
    fn version_history_summarizes_environments() {
        let repo = repo();
        let workflow = repo
            .create_workflow(OrganizationId::generate(), "wf", graph())
            .unwrap();

        let v1 = repo.create_version(&workflow.id, json!({}), None).unwrap();
        repo.publish_version(&v1.id, None).unwrap();
        repo.promote(&workflow.id, &v1.id, Environment::Test, false, false, None, no_providers)
            .unwrap();

        let history = repo.version_history(&workflow.id).unwrap();
        assert_eq!(history.versions.len(), 1);
        assert_eq!(history.deployments.len(), 1);
        assert!(history.environments.test.active_deployment.is_some());
        assert!(history.environments.production.active_deployment.is_none());
        assert_eq!(
            history.environments.test.version.as_ref().unwrap().id,
            v1.id
        );
    }

    #[test]
    fn resolve_graph_falls_back_through_environments() {
        let repo = repo();
        let workflow = repo
            .create_workflow(OrganizationId::generate(), "wf", graph())
            .unwrap();

        // nothing deployed: production resolves to the editable graph
        let (version_id, resolved) = repo
            .resolve_graph(&workflow.id, Environment::Production)
            .unwrap();
        assert!(version_id.is_none());
        assert_eq!(resolved.nodes.len(), 2);

        let v1 = repo.create_version(&workflow.id, json!({}), None).unwrap();
        repo.publish_version(&v1.id, None).unwrap();
        repo.promote(&workflow.id, &v1.id, Environment::Test, false, false, None, no_providers)
            .unwrap();

        let (version_id, _) = repo
            .resolve_graph(&workflow.id, Environment::Production)
            .unwrap();
        assert_eq!(version_id, Some(v1.id));
    }
}
