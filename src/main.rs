mod auth;
mod cli;
mod config;
mod database;
mod error;
mod http;
mod io_ext;
mod packager;
mod runner;
mod schema;
mod script_check;
mod state;
mod upload;

use crate::auth::Passwords;
use crate::cli::Cli;
use crate::config::{Config, DataDir};
use crate::database::SharedDatabase;
use crate::state::AppState;
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};

#[actix_web::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    simple_logger::SimpleLogger::new()
        .with_module_level("actix_server", LevelFilter::Off)
        .with_module_level("mio", LevelFilter::Off)
        .with_level(if cli.quiet {
            LevelFilter::Info
        } else {
            LevelFilter::Debug
        })
        .init()?;

    if cli.secret_key.trim().is_empty() {
        bail!("SECRET_KEY must not be empty");
    }

    let data_dir = match cli.data_dir {
        Some(data_dir) => data_dir,
        None => directories::ProjectDirs::from("com", "mrun", "mrun")
            .context("Failed to determine application directories")?
            .data_local_dir()
            .to_owned(),
    };
    let data_dir = DataDir::new(data_dir);
    data_dir.create()?;

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    info!(
        "Engines: {} ({}), fallback {} ({}), timeout {} seconds",
        config.primary.name,
        config.primary.program,
        config.fallback.name,
        config.fallback.program,
        config.timeout.as_secs_f64()
    );
    if !config.primary.is_available() && !config.fallback.is_available() {
        warn!(
            "Neither {} nor {} is installed, every run will fail",
            config.primary.program, config.fallback.program
        );
    }

    let database_url = cli
        .database_url
        .unwrap_or_else(|| data_dir.default_database_url());
    let db = SharedDatabase::open(&database_url)?;
    let interrupted = db.lock().fail_interrupted_jobs()?;
    if interrupted > 0 {
        warn!("Marked {interrupted} interrupted job(s) as failed");
    }

    let state = AppState::new(db, config, data_dir, Passwords::new(&cli.secret_key));
    http::start_server(state, &cli.host, cli.port).await?;

    Ok(())
}
