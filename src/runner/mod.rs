mod engine;
mod exec;
mod wrapper;

pub use self::engine::Engine;
use self::exec::{wait_with_timeout, ExecStatus};
use self::wrapper::WRAPPER_NAME;
use crate::config::Config;
use crate::database::{JobOutcome, JobStatus};
use crate::error::JobError;
use crate::io_ext::IoResultExt;
use anyhow::{Context, Result};
use log::{info, warn};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

pub const LOG_NAME: &str = "log.txt";

static DIVIDER: LazyLock<String> = LazyLock::new(|| "-".repeat(80));

#[derive(Debug, Eq, PartialEq)]
pub enum RunStatus {
    /// An engine ran the script to completion, `None` means that it was killed by a signal
    Exited { code: Option<i32> },
    /// An engine ran the script until the deadline
    TimedOut(Duration),
    /// The run was cancelled while an engine was running the script
    Cancelled,
    /// None of the engines could be started
    Unavailable { tried: Vec<String> },
}

#[derive(Debug)]
pub struct RunReport {
    /// The engine that ran the script
    pub engine: Option<String>,
    pub status: RunStatus,
    /// Everything written to the log file, including the engine's output
    pub log: String,
}

impl RunReport {
    /// Translate the report into the final state of the job
    pub fn into_outcome(self) -> JobOutcome {
        let error = match self.status {
            RunStatus::Exited { code: Some(0) } => None,
            RunStatus::Exited { code: Some(code) } => {
                Some(JobError::ExecutionFailed(code.to_string()))
            }
            RunStatus::Exited { code: None } => Some(JobError::ExecutionFailed(String::from(
                "unknown (terminated by a signal)",
            ))),
            RunStatus::TimedOut(timeout) => Some(JobError::Timeout(timeout)),
            RunStatus::Cancelled => Some(JobError::Cancelled),
            RunStatus::Unavailable { tried } => Some(JobError::EngineUnavailable {
                tried: tried.join(", "),
            }),
        };

        JobOutcome {
            status: if error.is_some() {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            },
            engine: self.engine,
            execution_log: self.log,
            error_message: error.map(|err| err.to_string()),
        }
    }
}

/// Runs scripts with the primary engine, falling back to the secondary engine once if the primary isn't installed
pub struct Runner {
    primary: Engine,
    fallback: Engine,
    timeout: Duration,
}

impl Runner {
    pub fn new(config: &Config) -> Self {
        Self {
            primary: config.primary.clone(),
            fallback: config.fallback.clone(),
            timeout: config.timeout,
        }
    }

    pub fn engines(&self) -> [&Engine; 2] {
        [&self.primary, &self.fallback]
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a script with `work_dir` as its working directory, blocking until it exits, times out or `cancelled`
    /// is set
    /// The engine's stdout and stderr are written to `log.txt` in the working directory.
    pub fn run(&self, script: &Path, work_dir: &Path, cancelled: &AtomicBool) -> Result<RunReport> {
        fs::create_dir_all(work_dir)
            .with_context(|| format!("Failed to create result dir {}", work_dir.display()))?;

        let wrapper_path = work_dir.join(WRAPPER_NAME);
        fs::write(&wrapper_path, wrapper::render(script, work_dir)).with_context(|| {
            format!("Failed to write wrapper script {}", wrapper_path.display())
        })?;

        let log_path = work_dir.join(LOG_NAME);
        let result = self.run_engines(script, &wrapper_path, &log_path, work_dir, cancelled);

        // The wrapper is an implementation detail and shouldn't show up in the results
        fs::remove_file(&wrapper_path)
            .ignore_not_found()
            .with_context(|| format!("Failed to remove wrapper script {}", wrapper_path.display()))?;

        let (engine, status) = result?;
        let log = fs::read(&log_path)
            .with_context(|| format!("Failed to read log file {}", log_path.display()))?;
        Ok(RunReport {
            engine,
            status,
            log: String::from_utf8_lossy(&log).into_owned(),
        })
    }

    fn run_engines(
        &self,
        script: &Path,
        wrapper_path: &Path,
        log_path: &Path,
        work_dir: &Path,
        cancelled: &AtomicBool,
    ) -> Result<(Option<String>, RunStatus)> {
        let script_name = script
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut log_file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(log_path)
            .with_context(|| format!("Failed to open log file {}", log_path.display()))?;
        let start_time = chrono::Local::now().to_rfc3339();
        log_file.write_all(format!("Script: {script_name}\nStarted: {start_time}\n").as_bytes())?;

        let mut tried = Vec::new();
        for engine in self.engines() {
            let clone_log_file = || log_file.try_clone().context("Failed to clone log file");
            let mut command = engine.command(wrapper_path, work_dir);
            command.stdout(clone_log_file()?).stderr(clone_log_file()?);

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    warn!("{script_name}: engine {} is not available", engine.name);
                    log_file.write_all(
                        format!("Engine {} is not available ({} not found)\n", engine.name, engine.program)
                            .as_bytes(),
                    )?;
                    tried.push(engine.name.clone());
                    continue;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Failed to start engine {}", engine.program))
                }
            };

            info!("{script_name}: running with engine {}", engine.name);
            log_file.write_all(format!("Engine: {}\n{}\n", engine.name, *DIVIDER).as_bytes())?;

            let started = Instant::now();
            let exec_status = wait_with_timeout(&mut child, self.timeout, cancelled)?;
            let status = match exec_status {
                ExecStatus::Exited(code) => RunStatus::Exited { code },
                ExecStatus::TimedOut => RunStatus::TimedOut(self.timeout),
                ExecStatus::Cancelled => RunStatus::Cancelled,
            };

            let status_str = match &status {
                RunStatus::Exited { code: Some(code) } => code.to_string(),
                RunStatus::Exited { code: None } => String::from("terminated"),
                RunStatus::Cancelled => String::from("cancelled"),
                _ => String::from("timed out"),
            };
            log_file.write_all(format!("{}\nStatus: {status_str}\n", *DIVIDER).as_bytes())?;
            match status {
                RunStatus::TimedOut(timeout) => {
                    warn!("{script_name}: timed out after {} seconds", timeout.as_secs_f64());
                    log_file.write_all(format!("{}\n", JobError::Timeout(timeout)).as_bytes())?;
                }
                RunStatus::Cancelled => {
                    info!("{script_name}: cancelled");
                    log_file.write_all(format!("{}\n", JobError::Cancelled).as_bytes())?;
                }
                _ => info!(
                    "{script_name}: finished with status {status_str} in {:.2} seconds",
                    started.elapsed().as_secs_f64()
                ),
            }

            return Ok((Some(engine.name.clone()), status));
        }

        log_file.write_all(
            format!("{}\n", JobError::EngineUnavailable { tried: tried.join(", ") }).as_bytes(),
        )?;
        Ok((None, RunStatus::Unavailable { tried }))
    }
}
