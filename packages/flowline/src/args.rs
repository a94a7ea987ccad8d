use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use utils::serde::deserialize_vec_string;

/// This struct is used for both args and environment variables
/// the basic idea is that every env var can be overriden by a cli arg
/// and these override the config file
/// env vars follow the pattern of FLOWLINE_{UPPERCASE_ARG_NAME}
#[derive(Debug, Parser, Serialize, Deserialize, Default, Clone)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct CliArgs {
    /// The home directory of the application, where the flowline.toml
    /// configuration file is stored. If not provided here or in an env
    /// var, a series of default directories will be tried
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,

    /// The path to an optional dotenv file to try and load
    /// if not set, will be the current working directory's .env
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dotenv: Option<PathBuf>,

    /// The port to bind the server to.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,

    /// Log level in the format of comma-separated tracing directives.
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "deserialize_vec_string")]
    pub log_level: Vec<String>,

    /// The host to bind the server to
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// The directory to store all internal data files
    /// Default is /var/flowline
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<PathBuf>,

    /// The allowed cors origins
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(deserialize_with = "deserialize_vec_string")]
    pub cors_allowed_origins: Vec<String>,

    /// Run in development mode: relaxed secrets, dev fallbacks allowed
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub development: Option<bool>,

    /// Queue driver: durable | inmemory | mock (inmemory is refused in
    /// production)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_driver: Option<String>,

    /// Number of executor worker tasks
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_workers: Option<usize>,

    /// The public base URL used to build resume callback URLs
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_public_url: Option<String>,

    /// Bearer token protecting mutating management routes
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,

    /// OTLP collector endpoint for traces (enables jaeger export)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jaeger: Option<String>,

    /// OTLP collector endpoint for metrics
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<String>,
}

impl CliArgs {
    pub const ENV_VAR_PREFIX: &'static str = "FLOWLINE";
}
