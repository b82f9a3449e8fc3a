use crate::database::{Job, JobStatus};
use chrono::NaiveDateTime;
use serde::Serialize;

#[derive(Serialize)]
pub struct JobInfo {
    pub(crate) id: i32,
    pub(crate) script_name: String,
    pub(crate) status: JobStatus,
    pub(crate) engine: Option<String>,
    pub(crate) error_message: Option<String>,
    pub(crate) created_at: NaiveDateTime,
    pub(crate) started_at: Option<NaiveDateTime>,
    pub(crate) finished_at: Option<NaiveDateTime>,
    /// Seconds between the upload and the end of the run
    pub(crate) duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) log: Option<String>,
}

impl JobInfo {
    // Generate the job info for a job, leaving out its log
    pub(crate) fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            script_name: job.script_name.clone(),
            status: job.status,
            engine: job.engine.clone(),
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            duration: job
                .duration()
                .map(|duration| duration.num_milliseconds() as f64 / 1000.0),
            log: None,
        }
    }

    pub(crate) fn with_log(job: &Job) -> Self {
        Self {
            log: job.execution_log.clone(),
            ..Self::from_job(job)
        }
    }
}
