use clap::Parser;
use std::path::PathBuf;

/// Budget pacer - real-time ad campaign budget pacing service
#[derive(Parser, Debug, Clone)]
#[command(name = "pacer", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "PACER_CONFIG", default_value = "pacer.toml")]
    pub config: PathBuf,

    /// Server host address
    #[arg(long, env = "PACER_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Counter store address (`host:port` or a full redis:// URL)
    #[arg(long, env = "REDIS_ADDR")]
    pub redis_addr: Option<String>,

    /// Campaign database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// IANA time zone for day/hour budget buckets
    #[arg(long, env = "PACER_TIMEZONE")]
    pub timezone: Option<String>,
}
