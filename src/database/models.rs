use crate::schema::{jobs, sessions, users};
use anyhow::{bail, Error, Result};
use chrono::{Duration, NaiveDateTime};
use diesel::prelude::*;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/*
 * A job only ever moves forward: pending -> running -> completed | failed.
 * Every status update in the database is guarded by the status it is expected
 * to move from, so a job can't be started twice or finished before it runs.
 */
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [Self; 4] = [Self::Pending, Self::Running, Self::Completed, Self::Failed];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Determine whether a job with this status is allowed to move to `next`
    pub fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(status: &str) -> Result<Self> {
        match Self::ALL.into_iter().find(|candidate| candidate.as_str() == status) {
            Some(status) => Ok(status),
            None => bail!("Invalid job status {status}"),
        }
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawJob {
    pub id: i32,
    pub script_name: String,
    pub script_path: String,
    pub result_path: Option<String>,
    pub status: String,
    pub engine: Option<String>,
    pub execution_log: Option<String>,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
}

#[derive(Clone, Debug)]
pub struct Job {
    pub id: i32,
    pub script_name: String,
    pub script_path: PathBuf,
    pub result_path: Option<PathBuf>,
    pub status: JobStatus,
    pub engine: Option<String>,
    pub execution_log: Option<String>,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
}

impl TryFrom<RawJob> for Job {
    type Error = Error;

    fn try_from(raw: RawJob) -> Result<Self> {
        Ok(Self {
            id: raw.id,
            script_name: raw.script_name,
            script_path: PathBuf::from(raw.script_path),
            result_path: raw.result_path.map(PathBuf::from),
            status: raw.status.parse()?,
            engine: raw.engine,
            execution_log: raw.execution_log,
            error_message: raw.error_message,
            created_at: raw.created_at,
            started_at: raw.started_at,
            finished_at: raw.finished_at,
        })
    }
}

impl Job {
    /// Time between the upload and the end of the run, if the job has finished
    pub fn duration(&self) -> Option<Duration> {
        self.finished_at
            .map(|finished_at| finished_at.signed_duration_since(self.created_at))
    }
}

#[derive(Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob<'a> {
    pub user_id: i32,
    pub script_name: &'a str,
    pub created_at: NaiveDateTime,
}

/// The final state of a job after the runner returns
#[derive(Debug)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub engine: Option<String>,
    pub execution_log: String,
    pub error_message: Option<String>,
}

/// Number of jobs a user has in each status
#[derive(Debug, Default, Eq, PartialEq, Serialize)]
pub struct JobStats {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl JobStats {
    pub fn add(&mut self, status: JobStatus, count: i64) {
        self.total += count;
        let bucket = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
        };
        *bucket += count;
    }
}

#[derive(Clone, Debug, Queryable, Selectable)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct User {
    pub id: i32,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub username: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub created_at: NaiveDateTime,
}

#[derive(Insertable)]
#[diesel(table_name = sessions)]
pub struct NewSession<'a> {
    pub token: &'a str,
    pub user_id: i32,
    pub created_at: NaiveDateTime,
}
