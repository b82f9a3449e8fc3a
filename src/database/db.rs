use super::models::{
    Job, JobOutcome, JobStats, JobStatus, NewJob, NewSession, NewUser, RawJob, User,
};
use crate::schema::{jobs, sessions, users};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::path::{Path, PathBuf};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();
const INTERRUPTED_MESSAGE: &str = "Execution was interrupted before it finished";

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Convert a database URL into the path that SQLite should open
/// `sqlite:///name.db` is relative to the working directory and `sqlite:////abs/name.db` is absolute.
fn database_path(url: &str) -> &str {
    url.strip_prefix("sqlite:///")
        .or_else(|| url.strip_prefix("sqlite://"))
        .unwrap_or(url)
}

pub struct Database {
    connection: SqliteConnection,
}

impl Database {
    /// Open the SQLite database at the given URL and bring its schema up to date
    pub fn open(url: &str) -> Result<Self> {
        let path = database_path(url);
        let mut connection = SqliteConnection::establish(path)
            .with_context(|| format!("Failed to open SQLite database {path}"))?;

        // Wait for other writers instead of failing immediately, and let deleted users cascade to their jobs
        connection
            .batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 1000;")
            .context("Failed to configure SQLite connection")?;
        connection
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow!(err.to_string()))
            .context("Failed to run SQLite migrations")?;

        Ok(Self { connection })
    }

    /// Record a new user
    pub fn insert_user(&mut self, username: &str, email: &str, password_hash: &str) -> Result<User> {
        diesel::insert_into(users::table)
            .values(NewUser {
                username,
                email,
                password_hash,
                created_at: now(),
            })
            .returning(User::as_returning())
            .get_result(&mut self.connection)
            .context("Failed to save user to the database")
    }

    /// Look up a user by either their username or their email address
    pub fn find_user(&mut self, login: &str) -> Result<Option<User>> {
        users::table
            .filter(users::username.eq(login).or(users::email.eq(login)))
            .select(User::as_select())
            .first(&mut self.connection)
            .optional()
            .context("Failed to load user from the database")
    }

    /// Find an existing user that already owns the username or the email address
    pub fn find_conflicting_user(&mut self, username: &str, email: &str) -> Result<Option<User>> {
        users::table
            .filter(users::username.eq(username).or(users::email.eq(email)))
            .select(User::as_select())
            .first(&mut self.connection)
            .optional()
            .context("Failed to check for existing users in the database")
    }

    pub fn insert_session(&mut self, token: &str, user_id: i32) -> Result<()> {
        diesel::insert_into(sessions::table)
            .values(NewSession {
                token,
                user_id,
                created_at: now(),
            })
            .execute(&mut self.connection)
            .context("Failed to save session to the database")?;
        Ok(())
    }

    /// Return the user that a session token belongs to
    pub fn get_session_user(&mut self, token: &str) -> Result<Option<User>> {
        sessions::table
            .inner_join(users::table)
            .filter(sessions::token.eq(token))
            .select(User::as_select())
            .first(&mut self.connection)
            .optional()
            .context("Failed to load session from the database")
    }

    pub fn delete_session(&mut self, token: &str) -> Result<()> {
        diesel::delete(sessions::table.find(token))
            .execute(&mut self.connection)
            .context("Failed to delete session from the database")?;
        Ok(())
    }

    /// Record a new pending job
    /// `store` receives the new job's id and returns the path that the script was written to. If it fails, the
    /// job record is rolled back so that no record exists without its script.
    pub fn create_job<F>(&mut self, user_id: i32, script_name: &str, store: F) -> Result<Job>
    where
        F: FnOnce(i32) -> Result<PathBuf>,
    {
        self.connection.transaction::<_, anyhow::Error, _>(|conn| {
            let raw = diesel::insert_into(jobs::table)
                .values(NewJob {
                    user_id,
                    script_name,
                    created_at: now(),
                })
                .returning(RawJob::as_returning())
                .get_result(conn)
                .context("Failed to save job to the database")?;

            let script_path = store(raw.id)?;
            let raw = diesel::update(jobs::table.find(raw.id))
                .set(jobs::script_path.eq(script_path.to_string_lossy().into_owned()))
                .returning(RawJob::as_returning())
                .get_result(conn)
                .context("Failed to save job script path to the database")?;
            Job::try_from(raw)
        })
    }

    /// Read one of a user's jobs
    pub fn get_job(&mut self, user_id: i32, job_id: i32) -> Result<Option<Job>> {
        jobs::table
            .find(job_id)
            .filter(jobs::user_id.eq(user_id))
            .select(RawJob::as_select())
            .first(&mut self.connection)
            .optional()
            .context("Failed to load job from the database")?
            .map(Job::try_from)
            .transpose()
    }

    /// Read a user's most recent jobs, newest first
    pub fn get_recent_jobs(&mut self, user_id: i32, count: i64) -> Result<Vec<Job>> {
        jobs::table
            .filter(jobs::user_id.eq(user_id))
            .order((jobs::created_at.desc(), jobs::id.desc()))
            .limit(count)
            .select(RawJob::as_select())
            .load(&mut self.connection)
            .context("Failed to load recent jobs from the database")?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    /// Count a user's jobs by status
    pub fn get_job_stats(&mut self, user_id: i32) -> Result<JobStats> {
        let counts = jobs::table
            .filter(jobs::user_id.eq(user_id))
            .group_by(jobs::status)
            .select((jobs::status, count_star()))
            .load::<(String, i64)>(&mut self.connection)
            .context("Failed to count jobs in the database")?;

        let mut stats = JobStats::default();
        for (status, count) in counts {
            stats.add(status.parse()?, count);
        }
        Ok(stats)
    }

    /// Move a pending job to running
    /// Returns `None` if the job doesn't exist or isn't pending anymore.
    pub fn start_job(&mut self, job_id: i32, result_path: &Path) -> Result<Option<Job>> {
        diesel::update(
            jobs::table
                .find(job_id)
                .filter(jobs::status.eq(JobStatus::Pending.as_str())),
        )
        .set((
            jobs::status.eq(JobStatus::Running.as_str()),
            jobs::result_path.eq(result_path.to_string_lossy().into_owned()),
            jobs::execution_log.eq("Starting execution..."),
            jobs::started_at.eq(now()),
        ))
        .returning(RawJob::as_returning())
        .get_result(&mut self.connection)
        .optional()
        .context("Failed to mark job as running in the database")?
        .map(Job::try_from)
        .transpose()
    }

    /// Move a running job to its final status
    /// Returns `None` if the job doesn't exist or isn't running anymore.
    pub fn finish_job(&mut self, job_id: i32, outcome: &JobOutcome) -> Result<Option<Job>> {
        if !JobStatus::Running.can_advance_to(outcome.status) {
            bail!("Job {job_id} can't finish with status {}", outcome.status);
        }

        diesel::update(
            jobs::table
                .find(job_id)
                .filter(jobs::status.eq(JobStatus::Running.as_str())),
        )
        .set((
            jobs::status.eq(outcome.status.as_str()),
            jobs::engine.eq(outcome.engine.as_deref()),
            jobs::execution_log.eq(outcome.execution_log.as_str()),
            jobs::error_message.eq(outcome.error_message.as_deref()),
            jobs::finished_at.eq(now()),
        ))
        .returning(RawJob::as_returning())
        .get_result(&mut self.connection)
        .optional()
        .context("Failed to save job outcome to the database")?
        .map(Job::try_from)
        .transpose()
    }

    /// Fail one of a user's running jobs with `message`
    /// Returns `None` if the job doesn't exist or isn't running.
    pub fn cancel_job(&mut self, user_id: i32, job_id: i32, message: &str) -> Result<Option<Job>> {
        diesel::update(
            jobs::table
                .find(job_id)
                .filter(jobs::user_id.eq(user_id))
                .filter(jobs::status.eq(JobStatus::Running.as_str())),
        )
        .set((
            jobs::status.eq(JobStatus::Failed.as_str()),
            jobs::error_message.eq(message),
            jobs::finished_at.eq(now()),
        ))
        .returning(RawJob::as_returning())
        .get_result(&mut self.connection)
        .optional()
        .context("Failed to cancel job in the database")?
        .map(Job::try_from)
        .transpose()
    }

    /// Fail every job that is still marked as running
    /// No script can be running when the server starts, so these were interrupted by a crash or a restart.
    pub fn fail_interrupted_jobs(&mut self) -> Result<usize> {
        diesel::update(jobs::table.filter(jobs::status.eq(JobStatus::Running.as_str())))
            .set((
                jobs::status.eq(JobStatus::Failed.as_str()),
                jobs::error_message.eq(INTERRUPTED_MESSAGE),
                jobs::finished_at.eq(now()),
            ))
            .execute(&mut self.connection)
            .context("Failed to fail interrupted jobs in the database")
    }

    /// Delete one of a user's jobs and return it
    /// Returns `None` if the job doesn't exist or is running.
    pub fn delete_job(&mut self, user_id: i32, job_id: i32) -> Result<Option<Job>> {
        diesel::delete(
            jobs::table
                .find(job_id)
                .filter(jobs::user_id.eq(user_id))
                .filter(jobs::status.ne(JobStatus::Running.as_str())),
        )
        .returning(RawJob::as_returning())
        .get_result(&mut self.connection)
        .optional()
        .context("Failed to delete job from the database")?
        .map(Job::try_from)
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn open() -> (Database, User) {
        let mut db = Database::open(":memory:").unwrap();
        let user = db.insert_user("alice", "alice@example.com", "hash").unwrap();
        (db, user)
    }

    fn create_job(db: &mut Database, user_id: i32) -> Job {
        db.create_job(user_id, "demo.m", |id| Ok(PathBuf::from(format!("uploads/{id}/demo.m"))))
            .unwrap()
    }

    #[test]
    fn test_database_path() {
        assert_eq!(database_path("sqlite:///database.db"), "database.db");
        assert_eq!(database_path("sqlite:////var/lib/mrun.db"), "/var/lib/mrun.db");
        assert_eq!(database_path("/var/lib/mrun.db"), "/var/lib/mrun.db");
        assert_eq!(database_path(":memory:"), ":memory:");
    }

    #[test]
    fn test_find_user() {
        let (mut db, user) = open();
        assert_matches!(db.find_user("alice").unwrap(), Some(found) if found.id == user.id);
        assert_matches!(db.find_user("alice@example.com").unwrap(), Some(found) if found.id == user.id);
        assert!(db.find_user("bob").unwrap().is_none());

        assert!(db.find_conflicting_user("alice", "other@example.com").unwrap().is_some());
        assert!(db.find_conflicting_user("bob", "alice@example.com").unwrap().is_some());
        assert!(db.find_conflicting_user("bob", "bob@example.com").unwrap().is_none());
        assert!(db.insert_user("alice", "x@example.com", "hash").is_err());
    }

    #[test]
    fn test_sessions() {
        let (mut db, user) = open();
        db.insert_session("token", user.id).unwrap();
        assert_matches!(db.get_session_user("token").unwrap(), Some(found) if found.id == user.id);
        assert!(db.get_session_user("other").unwrap().is_none());

        db.delete_session("token").unwrap();
        assert!(db.get_session_user("token").unwrap().is_none());
    }

    #[test]
    fn test_create_job() {
        let (mut db, user) = open();
        let job = create_job(&mut db, user.id);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.script_name, "demo.m");
        assert_eq!(job.script_path, PathBuf::from(format!("uploads/{}/demo.m", job.id)));
        assert!(job.duration().is_none());
    }

    #[test]
    fn test_create_job_rolls_back() {
        let (mut db, user) = open();
        assert!(db
            .create_job(user.id, "demo.m", |_| bail!("disk full"))
            .is_err());
        assert!(db.get_recent_jobs(user.id, 20).unwrap().is_empty());
        assert_eq!(db.get_job_stats(user.id).unwrap().total, 0);
    }

    #[test]
    fn test_jobs_are_scoped_to_owner() {
        let (mut db, user) = open();
        let other = db.insert_user("bob", "bob@example.com", "hash").unwrap();
        let job = create_job(&mut db, user.id);

        assert!(db.get_job(user.id, job.id).unwrap().is_some());
        assert!(db.get_job(other.id, job.id).unwrap().is_none());
        assert!(db.delete_job(other.id, job.id).unwrap().is_none());
        assert!(db.get_recent_jobs(other.id, 20).unwrap().is_empty());
    }

    #[test]
    fn test_status_only_moves_forward() {
        let (mut db, user) = open();
        let job = create_job(&mut db, user.id);
        let outcome = JobOutcome {
            status: JobStatus::Completed,
            engine: Some("octave".to_owned()),
            execution_log: "done".to_owned(),
            error_message: None,
        };

        // Can't finish a job that never started
        assert!(db.finish_job(job.id, &outcome).unwrap().is_none());

        let started = db.start_job(job.id, Path::new("results/1")).unwrap().unwrap();
        assert_eq!(started.status, JobStatus::Running);
        assert_eq!(started.result_path, Some(PathBuf::from("results/1")));
        assert!(started.started_at.is_some());

        // Can't start a job twice
        assert!(db.start_job(job.id, Path::new("results/1")).unwrap().is_none());

        let finished = db.finish_job(job.id, &outcome).unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.engine.as_deref(), Some("octave"));
        assert_eq!(finished.execution_log.as_deref(), Some("done"));
        assert!(finished.duration().is_some());

        // Can't finish a job twice
        assert!(db.finish_job(job.id, &outcome).unwrap().is_none());
        assert!(db.start_job(job.id, Path::new("results/1")).unwrap().is_none());
    }

    #[test]
    fn test_finish_rejects_unfinished_status() {
        let (mut db, user) = open();
        let job = create_job(&mut db, user.id);
        db.start_job(job.id, Path::new("results/1")).unwrap();
        let outcome = JobOutcome {
            status: JobStatus::Pending,
            engine: None,
            execution_log: String::new(),
            error_message: None,
        };
        assert!(db.finish_job(job.id, &outcome).is_err());
    }

    #[test]
    fn test_recent_jobs_and_stats() {
        let (mut db, user) = open();
        let first = create_job(&mut db, user.id);
        let second = create_job(&mut db, user.id);
        db.start_job(first.id, Path::new("results")).unwrap();

        let recent = db.get_recent_jobs(user.id, 20).unwrap();
        assert_eq!(
            recent.iter().map(|job| job.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );
        assert_eq!(db.get_recent_jobs(user.id, 1).unwrap().len(), 1);

        let stats = db.get_job_stats(user.id).unwrap();
        assert_eq!(
            stats,
            JobStats {
                total: 2,
                pending: 1,
                running: 1,
                completed: 0,
                failed: 0,
            }
        );
    }

    #[test]
    fn test_delete_job() {
        let (mut db, user) = open();
        let job = create_job(&mut db, user.id);
        assert_matches!(db.delete_job(user.id, job.id).unwrap(), Some(deleted) if deleted.id == job.id);
        assert!(db.get_job(user.id, job.id).unwrap().is_none());
        assert!(db.delete_job(user.id, job.id).unwrap().is_none());
    }

    #[test]
    fn test_running_job_is_not_deleted() {
        let (mut db, user) = open();
        let job = create_job(&mut db, user.id);
        db.start_job(job.id, Path::new("results/1")).unwrap();
        assert!(db.delete_job(user.id, job.id).unwrap().is_none());
        assert_matches!(
            db.get_job(user.id, job.id).unwrap(),
            Some(found) if found.status == JobStatus::Running
        );
    }

    #[test]
    fn test_fail_interrupted_jobs() {
        let (mut db, user) = open();
        let pending = create_job(&mut db, user.id);
        let running = create_job(&mut db, user.id);
        db.start_job(running.id, Path::new("results/2")).unwrap();

        assert_eq!(db.fail_interrupted_jobs().unwrap(), 1);
        let failed = db.get_job(user.id, running.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert!(failed.finished_at.is_some());
        assert_eq!(
            db.get_job(user.id, pending.id).unwrap().unwrap().status,
            JobStatus::Pending
        );

        // A failed job can be deleted again
        assert!(db.delete_job(user.id, running.id).unwrap().is_some());
        assert_eq!(db.fail_interrupted_jobs().unwrap(), 0);
    }

    #[test]
    fn test_cancel_job() {
        let (mut db, user) = open();
        let job = create_job(&mut db, user.id);
        // Only running jobs can be cancelled
        assert!(db.cancel_job(user.id, job.id, "Cancelled").unwrap().is_none());

        db.start_job(job.id, Path::new("results/1")).unwrap();
        let other = db.insert_user("bob", "bob@example.com", "hash").unwrap();
        assert!(db.cancel_job(other.id, job.id, "Cancelled").unwrap().is_none());

        let cancelled = db.cancel_job(user.id, job.id, "Cancelled").unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error_message.as_deref(), Some("Cancelled"));

        // The run that was cancelled can't overwrite the outcome
        let outcome = JobOutcome {
            status: JobStatus::Completed,
            engine: Some(String::from("matlab")),
            execution_log: String::from("done"),
            error_message: None,
        };
        assert!(db.finish_job(job.id, &outcome).unwrap().is_none());
        assert_eq!(
            db.get_job(user.id, job.id).unwrap().unwrap().error_message.as_deref(),
            Some("Cancelled")
        );
    }
}
