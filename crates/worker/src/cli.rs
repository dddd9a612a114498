use std::path::PathBuf;

use clap::Parser;

use jobforge_observability::LogFormat;

/// jobforge worker - runs background jobs from a job store
#[derive(Parser, Debug)]
#[command(name = "jobforge-worker")]
pub struct Args {
    /// Runner config file (TOML); defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log output format: json or pretty
    #[arg(long, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Postgres connection string; the in-memory store is used when unset
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Postgres pool size
    #[arg(long, default_value_t = 5)]
    pub max_connections: u32,

    /// Enqueue a few sample jobs at startup
    #[arg(long)]
    pub demo: bool,
}
