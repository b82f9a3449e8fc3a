use crate::database::JobStatus;
use std::time::Duration;
use thiserror::Error;

/// Failures scoped to a single job or upload
///
/// None of these are fatal to the server. The execution variants are recorded on the job itself and the
/// rest are turned into HTTP responses.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("File is larger than the {limit} byte upload limit")]
    UploadTooLarge { limit: usize },

    #[error("No execution engine is available (tried {tried})")]
    EngineUnavailable { tried: String },

    #[error("Script execution timed out after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Script exited with status {0}")]
    ExecutionFailed(String),

    #[error("Execution cancelled by user")]
    Cancelled,

    #[error("No results available for job {0}")]
    NoResults(i32),

    #[error("Job {0} not found")]
    NotFound(i32),

    #[error("Job {0} is still running")]
    StillRunning(i32),

    #[error("Job {0} is not running")]
    NotRunning(i32),

    #[error("Job {id} is {from} and cannot become {to}")]
    InvalidTransition {
        id: i32,
        from: JobStatus,
        to: JobStatus,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
