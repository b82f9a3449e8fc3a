use crate::auth::{self, AuthError, Credentials, Passwords, Registration};
use crate::config::{Config, DataDir};
use crate::database::{Job, JobOutcome, JobStats, JobStatus, SharedDatabase, User};
use crate::error::JobError;
use crate::io_ext::IoResultExt;
use crate::packager::{self, Archive};
use crate::runner::Runner;
use crate::upload::ScriptUpload;
use anyhow::Context;
use log::{error, info};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Number of jobs listed on the job overview
pub const RECENT_JOB_COUNT: i64 = 20;

#[derive(Serialize)]
pub struct EngineInfo {
    pub name: String,
    pub program: String,
    pub available: bool,
}

#[derive(Serialize)]
pub struct SystemInfo {
    pub engines: Vec<EngineInfo>,
    /// Run timeout in seconds
    pub timeout: u64,
    #[serde(rename = "maxUploadSize")]
    pub max_upload_size: usize,
    #[serde(rename = "strictScripts")]
    pub strict_scripts: bool,
}

/// Everything the HTTP handlers share
/// All methods are synchronous. Ones that hash passwords, run scripts or build archives should be called from
/// `web::block`.
#[derive(Clone)]
pub struct AppState {
    db: SharedDatabase,
    config: Arc<Config>,
    runner: Arc<Runner>,
    data_dir: DataDir,
    passwords: Passwords,
    /// Cancellation flags of the jobs this process is running, by job id
    cancel_flags: Arc<Mutex<HashMap<i32, Arc<AtomicBool>>>>,
}

impl AppState {
    pub fn new(db: SharedDatabase, config: Config, data_dir: DataDir, passwords: Passwords) -> Self {
        Self {
            db,
            runner: Arc::new(Runner::new(&config)),
            config: Arc::new(config),
            data_dir,
            passwords,
            cancel_flags: Arc::default(),
        }
    }

    fn cancel_flags(&self) -> MutexGuard<HashMap<i32, Arc<AtomicBool>>> {
        self.cancel_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn register(&self, registration: Registration) -> Result<User, AuthError> {
        let registration = registration.validate()?;
        let existing = self
            .db
            .lock()
            .find_conflicting_user(&registration.username, &registration.email)?;
        if let Some(existing) = existing {
            return Err(AuthError::Conflict(
                if existing.username == registration.username {
                    "Username"
                } else {
                    "Email"
                },
            ));
        }

        let password_hash = self.passwords.hash(&registration.password)?;
        let user = self.db.lock().insert_user(
            &registration.username,
            &registration.email,
            &password_hash,
        )?;
        info!("Registered user {}", user.username);
        Ok(user)
    }

    /// Check a user's credentials and open a new session for them
    pub fn login(&self, credentials: &Credentials) -> Result<(String, User), AuthError> {
        let login = credentials.login.trim();
        let login = if login.contains('@') {
            login.to_lowercase()
        } else {
            login.to_owned()
        };

        let user = self.db.lock().find_user(&login)?;
        let Some(user) = user else {
            self.passwords.verify_unknown(&credentials.password)?;
            return Err(AuthError::InvalidCredentials);
        };
        if !self
            .passwords
            .verify(&credentials.password, &user.password_hash)?
        {
            info!("Rejected login for {}", user.username);
            return Err(AuthError::InvalidCredentials);
        }

        let token = auth::new_token();
        self.db.lock().insert_session(&token, user.id)?;
        info!("Logged in user {}", user.username);
        Ok((token, user))
    }

    pub fn logout(&self, token: &str) -> Result<(), AuthError> {
        self.db.lock().delete_session(token)?;
        Ok(())
    }

    /// Find the user that a session token belongs to
    pub fn authenticate(&self, token: &str) -> Result<User, AuthError> {
        self.db
            .lock()
            .get_session_user(token)?
            .ok_or(AuthError::Unauthorized)
    }

    /// Record a pending job for a validated upload and store its script
    pub fn create_job(&self, user: &User, upload: &ScriptUpload) -> Result<Job, JobError> {
        let job = self.db.lock().create_job(user.id, &upload.file_name, |job_id| {
            upload.store(&self.data_dir.upload_dir(job_id))
        })?;
        info!(
            "{} uploaded {} as job {}",
            user.username, job.script_name, job.id
        );
        Ok(job)
    }

    pub fn get_job(&self, user: &User, job_id: i32) -> Result<Job, JobError> {
        self.db
            .lock()
            .get_job(user.id, job_id)?
            .ok_or(JobError::NotFound(job_id))
    }

    pub fn recent_jobs(&self, user: &User) -> Result<(Vec<Job>, JobStats), JobError> {
        let mut db = self.db.lock();
        let jobs = db.get_recent_jobs(user.id, RECENT_JOB_COUNT)?;
        let stats = db.get_job_stats(user.id)?;
        Ok((jobs, stats))
    }

    /// Run a pending job to completion, blocking until the engine exits, times out or is cancelled
    pub fn run_job(&self, user: &User, job_id: i32) -> Result<Job, JobError> {
        let job = self.get_job(user, job_id)?;
        let result_dir = self.data_dir.result_dir(job.id);
        let cancelled = Arc::new(AtomicBool::new(false));
        let started = {
            // Hold the flags while starting so that a cancel can't land before the flag is registered
            let mut flags = self.cancel_flags();
            let started = self.db.lock().start_job(job.id, &result_dir)?;
            if started.is_some() {
                flags.insert(job.id, Arc::clone(&cancelled));
            }
            started
        };
        let Some(job) = started else {
            // Someone else started the job first, or it already ran
            let current = self.get_job(user, job_id)?;
            return Err(JobError::InvalidTransition {
                id: job_id,
                from: current.status,
                to: JobStatus::Running,
            });
        };

        let result = self.runner.run(&job.script_path, &result_dir, &cancelled);
        self.cancel_flags().remove(&job.id);
        let outcome = match result {
            Ok(report) => report.into_outcome(),
            Err(err) => {
                error!("Job {}: failed to run script\n{err:?}", job.id);
                JobOutcome {
                    status: JobStatus::Failed,
                    engine: None,
                    execution_log: format!("Execution error: {err:#}"),
                    error_message: Some(String::from("Execution error")),
                }
            }
        };
        info!("Job {} {}", job.id, outcome.status);

        let finished = self.db.lock().finish_job(job.id, &outcome)?;
        match finished {
            Some(job) => Ok(job),
            // The job was cancelled while it ran, and running jobs can't be deleted
            None => self.get_job(user, job_id),
        }
    }

    /// Fail a running job and stop its engine if this process is running it
    pub fn cancel_job(&self, user: &User, job_id: i32) -> Result<Job, JobError> {
        let flags = self.cancel_flags();
        let cancelled = self
            .db
            .lock()
            .cancel_job(user.id, job_id, &JobError::Cancelled.to_string())?;
        let Some(job) = cancelled else {
            self.get_job(user, job_id)?;
            return Err(JobError::NotRunning(job_id));
        };

        // Jobs stranded by an earlier error have no engine left to stop
        if let Some(flag) = flags.get(&job.id) {
            flag.store(true, Ordering::Relaxed);
        }
        info!("{} cancelled job {}", user.username, job.id);
        Ok(job)
    }

    /// Build the results archive of a finished job
    pub fn package(&self, user: &User, job_id: i32) -> Result<Archive, JobError> {
        let job = self.get_job(user, job_id)?;
        if !job.status.is_finished() {
            return Err(JobError::NoResults(job.id));
        }
        packager::package(&job)
    }

    /// Delete a job along with its uploaded script and its results
    pub fn delete_job(&self, user: &User, job_id: i32) -> Result<Job, JobError> {
        let deleted = self.db.lock().delete_job(user.id, job_id)?;
        let Some(job) = deleted else {
            // Either the job doesn't exist or it is running
            self.get_job(user, job_id)?;
            return Err(JobError::StillRunning(job_id));
        };
        for dir in [
            self.data_dir.upload_dir(job.id),
            self.data_dir.result_dir(job.id),
        ] {
            fs::remove_dir_all(&dir)
                .ignore_not_found()
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        info!("Deleted job {}", job.id);
        Ok(job)
    }

    pub fn system_info(&self) -> SystemInfo {
        SystemInfo {
            engines: self
                .runner
                .engines()
                .into_iter()
                .map(|engine| EngineInfo {
                    name: engine.name.clone(),
                    program: engine.program.clone(),
                    available: engine.is_available(),
                })
                .collect(),
            timeout: self.runner.timeout().as_secs(),
            max_upload_size: self.config.max_upload_size,
            strict_scripts: self.config.strict_scripts,
        }
    }
}
