use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use flowline_types::ErrorResponse;

use crate::admission::AdmissionError;
use crate::connections::ConnectionError;
use crate::dispatcher::DispatcherError;
use crate::enqueue::EnqueueError;
use crate::repo::RepoError;
use crate::subsystems::timers::ResumeError;
use crate::subsystems::trigger::webhook::WebhookError;

pub type HttpResult<T> = Result<T, HttpError>;

/// Maps every subsystem failure onto a status code and the constant
/// `{success: false, error}` body. The message never varies with secret
/// state.
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse::new(self.message))).into_response()
    }
}

impl From<RepoError> for HttpError {
    fn from(err: RepoError) -> Self {
        let status = match &err {
            RepoError::WorkflowNotFound(_) | RepoError::VersionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            RepoError::BreakingChanges(_) => StatusCode::CONFLICT,
            RepoError::AlreadyPublished(_)
            | RepoError::NotPublished(_)
            | RepoError::NotStaged(_)
            | RepoError::VersionWorkflowMismatch(_)
            | RepoError::Graph(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RepoError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<EnqueueError> for HttpError {
    fn from(err: EnqueueError) -> Self {
        let status = match &err {
            EnqueueError::OrgNotFound => StatusCode::NOT_FOUND,
            EnqueueError::OrgInactive => StatusCode::FORBIDDEN,
            EnqueueError::Quota(AdmissionError::QuotaExceeded { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<DispatcherError> for HttpError {
    fn from(err: DispatcherError) -> Self {
        match err {
            DispatcherError::ExecutionNotFound(_) => Self::not_found(err.to_string()),
            DispatcherError::NoNodeHistory(_, _) => Self::bad_request(err.to_string()),
            DispatcherError::Repo(repo) => repo.into(),
            DispatcherError::Enqueue(enqueue) => enqueue.into(),
            DispatcherError::Engine(engine) => Self::bad_request(engine.to_string()),
            DispatcherError::Db(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl From<WebhookError> for HttpError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Unknown => Self::not_found("unknown webhook"),
            // constant shape and constant text: the caller cannot learn
            // whether a secret exists or which check failed
            WebhookError::Verification(_) => {
                Self::new(StatusCode::UNAUTHORIZED, "verification failed")
            }
            WebhookError::Enqueue(enqueue) => enqueue.into(),
            WebhookError::Db(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl From<ResumeError> for HttpError {
    fn from(err: ResumeError) -> Self {
        let status = match &err {
            ResumeError::InvalidSignature => StatusCode::UNAUTHORIZED,
            ResumeError::TokenUnknown => StatusCode::NOT_FOUND,
            ResumeError::TokenConsumed => StatusCode::GONE,
            ResumeError::TokenExpired => StatusCode::GONE,
            ResumeError::ExecutionNotActive => StatusCode::CONFLICT,
            ResumeError::Enqueue(EnqueueError::Quota(_)) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<ConnectionError> for HttpError {
    fn from(err: ConnectionError) -> Self {
        let status = match &err {
            ConnectionError::NotFound(_) => StatusCode::NOT_FOUND,
            ConnectionError::Duplicate { .. } => StatusCode::CONFLICT,
            ConnectionError::TokenExpired | ConnectionError::TokenConsumed => StatusCode::GONE,
            ConnectionError::TokenUnknown => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}
