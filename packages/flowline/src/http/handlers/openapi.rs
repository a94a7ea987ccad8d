use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        super::health::handle_health,
        super::production::handle_queue_heartbeat,
        super::production::handle_ready,
        super::workflows::handle_list_versions,
        super::executions::handle_enqueue_execution,
        super::executions::handle_get_execution,
    ),
    components(schemas(
        crate::health::HealthStatus,
        crate::health::QueueHealth,
        flowline_types::ComponentReadiness,
        flowline_types::ErrorResponse,
        flowline_types::VersionHistoryResponse,
        flowline_types::ValidateVersionRequest,
        flowline_types::ValidateVersionResponse,
        flowline_types::PromoteVersionRequest,
        flowline_types::PromoteVersionResponse,
        flowline_types::EnqueueExecutionRequest,
        flowline_types::EnqueueExecutionResponse,
        flowline_types::ExecutionDetailResponse,
        flowline_types::RetryExecutionResponse,
        flowline_types::WebhookAccepted,
        flowline_types::QueueHeartbeatResponse,
        flowline_types::ReadinessResponse,
    )),
    info(
        title = "Flowline API",
        description = "Workflow automation core: versions, executions, triggers"
    )
)]
pub struct ApiDoc;
