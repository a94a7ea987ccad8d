use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;
use utils::storage::db::handles;

use crate::config::{Config, QueueDriverKind, Secrets};
use crate::dispatcher::Dispatcher;
use crate::subsystems::queue::QueueDriver;

/// Startup gatekeeper: configuration problems abort with exit code 2
/// before any subsystem starts, so a misconfigured pod crash-loops
/// loudly rather than serving on a non-durable queue.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("configuration: {0}")]
    Config(String),

    #[error("startup: {0}")]
    Startup(String),
}

impl SupervisorError {
    /// Exit code contract: 2 for configuration errors, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::Config(_) => 2,
            SupervisorError::Startup(_) => 1,
        }
    }
}

#[instrument(level = "debug", skip_all, fields(subsys = "Supervisor"))]
pub fn startup_checks(
    config: &Config,
    secrets: &Secrets,
    dispatcher: &Arc<Dispatcher>,
) -> Result<(), SupervisorError> {
    let production = !config.development;

    if production {
        if secrets.database_url.is_none() {
            return Err(SupervisorError::Config(
                "DATABASE_URL is required in production".to_string(),
            ));
        }
        if secrets.jwt_secret.is_none() {
            return Err(SupervisorError::Config(
                "JWT_SECRET is required in production".to_string(),
            ));
        }

        let kind = config
            .queue_driver_kind()
            .map_err(|e| SupervisorError::Config(e.to_string()))?;
        if kind == QueueDriverKind::InMemory {
            return Err(SupervisorError::Config(
                "in-memory queue driver is refused in production".to_string(),
            ));
        }
        if !dispatcher.enqueue.queue().durable() && kind != QueueDriverKind::Mock {
            return Err(SupervisorError::Config(
                "queue driver is not durable".to_string(),
            ));
        }
    }

    // data dir must be writable before anything persists into it
    std::fs::create_dir_all(&config.data)
        .map_err(|e| SupervisorError::Startup(format!("data dir {}: {}", config.data.display(), e)))?;
    let probe = config.data.join(".startup-probe");
    std::fs::write(&probe, b"ok")
        .and_then(|_| std::fs::remove_file(&probe))
        .map_err(|e| SupervisorError::Startup(format!("data dir not writable: {}", e)))?;

    // every required table must be reachable with its expected types
    let db = &dispatcher.db;
    let reachable = db
        .len(&handles::ORGANIZATIONS)
        .and(db.len(&handles::WORKFLOWS))
        .and(db.len(&handles::WORKFLOW_VERSIONS))
        .and(db.len(&handles::WORKFLOW_DEPLOYMENTS))
        .and(db.len(&handles::EXECUTIONS))
        .and(db.len(&handles::NODE_EXECUTIONS))
        .and(db.len(&handles::NODE_RESULTS))
        .and(db.len(&handles::CONNECTIONS))
        .and(db.len(&handles::SCOPED_TOKENS))
        .and(db.len(&handles::RESUME_TOKENS))
        .and(db.len(&handles::TIMERS))
        .and(db.len(&handles::WEBHOOK_TRIGGERS))
        .and(db.len(&handles::POLLING_TRIGGERS))
        .and(db.len(&handles::WEBHOOK_DEDUPE))
        .and(db.len(&handles::EXECUTION_COUNTERS))
        .and(db.len(&handles::QUOTA_AUDIT))
        .and(db.len(&handles::ENCRYPTION_KEYS));
    reachable.map_err(|e| SupervisorError::Startup(format!("required tables unreachable: {}", e)))?;

    tracing::info!(
        production,
        queue_driver = dispatcher.enqueue.queue().driver_name(),
        durable = dispatcher.enqueue.queue().durable(),
        "startup checks passed"
    );
    Ok(())
}
