use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(about, version, author)]
pub struct Cli {
    /// HTTP server port
    #[clap(short = 'p', long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// HTTP server address
    #[clap(long, env = "MRUN_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Key mixed into every password hash
    #[clap(long, env = "SECRET_KEY", hide_env_values = true)]
    pub secret_key: String,

    /// SQLite database location, defaults to a file in the data directory
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Directory holding uploaded scripts and their results
    #[clap(short = 'd', long, env = "MRUN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Path to the TOML configuration file
    #[clap(short = 'c', long, env = "MRUN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log fewer messages
    #[clap(short = 'q', long)]
    pub quiet: bool,
}
