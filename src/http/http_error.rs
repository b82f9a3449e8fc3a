use crate::auth::AuthError;
use crate::error::JobError;
use actix_multipart::MultipartError;
use actix_web::error::BlockingError;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use core::fmt;
use log::error;
use serde_json::json;
use std::error::Error;

#[derive(Debug)]
pub enum HttpError {
    /// An error that is safe to show to the client
    Client(StatusCode, String),
    /// An error whose details are only logged
    Internal(anyhow::Error),
}

impl HttpError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Client(StatusCode::BAD_REQUEST, message.into())
    }

    fn message(&self) -> String {
        match self {
            Self::Client(_, message) => message.clone(),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR
                .canonical_reason()
                .unwrap_or("unknown")
                .to_owned(),
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.status_code().as_str(), self.message())
    }
}

impl Error for HttpError {}

impl ResponseError for HttpError {
    fn error_response(&self) -> HttpResponse {
        if let Self::Internal(err) = self {
            error!("Internal server error\n{err:?}");
        }
        HttpResponse::build(self.status_code()).json(json!({ "error": self.message() }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Client(status_code, _) => *status_code,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JobError> for HttpError {
    fn from(err: JobError) -> Self {
        let status_code = match err {
            JobError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
            JobError::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            JobError::NotFound(_) | JobError::NoResults(_) => StatusCode::NOT_FOUND,
            JobError::InvalidTransition { .. }
            | JobError::StillRunning(_)
            | JobError::NotRunning(_) => StatusCode::CONFLICT,
            // Execution failures are recorded on the job and never reach a response
            JobError::EngineUnavailable { .. }
            | JobError::Timeout(_)
            | JobError::ExecutionFailed(_)
            | JobError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            JobError::Internal(err) => return Self::Internal(err),
        };
        let message = match err {
            JobError::InvalidUpload(message) => message,
            JobError::NotFound(_) => String::from("Job not found"),
            JobError::NoResults(_) => String::from("No results available"),
            err => err.to_string(),
        };
        Self::Client(status_code, message)
    }
}

impl From<AuthError> for HttpError {
    fn from(err: AuthError) -> Self {
        let status_code = match err {
            AuthError::InvalidRegistration(_) => StatusCode::BAD_REQUEST,
            AuthError::Conflict(_) => StatusCode::CONFLICT,
            AuthError::InvalidCredentials | AuthError::Unauthorized => StatusCode::UNAUTHORIZED,
            AuthError::Internal(err) => return Self::Internal(err),
        };
        Self::Client(status_code, err.to_string())
    }
}

impl From<anyhow::Error> for HttpError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<BlockingError> for HttpError {
    fn from(err: BlockingError) -> Self {
        Self::Internal(anyhow::anyhow!("Blocking task was canceled: {err}"))
    }
}

impl From<MultipartError> for HttpError {
    fn from(err: MultipartError) -> Self {
        Self::bad_request(format!("Invalid multipart upload: {err}"))
    }
}
