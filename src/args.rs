use clap::{Parser, Subcommand};
use once_cell::sync::Lazy;
use sqlcover::config::{CoverageConfig, TraceScope};
use sqlcover::error::ConfigError;
use std::path::PathBuf;

// Global static variable to store parsed CLI arguments
pub static ARGS: Lazy<CliArgs> = Lazy::new(CliArgs::parse);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None, name = "sqlcover")]
pub struct CliArgs {
    /// TOML configuration file; flags below override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// SQL Server instance, e.g. `localhost` or `db01,1433`
    #[arg(short = 'S', long)]
    pub server: Option<String>,

    /// Database whose modules are measured
    #[arg(short, long)]
    pub database: Option<String>,

    /// SQL login (password taken from SQLCMDPASSWORD), trusted auth if absent
    #[arg(short = 'U', long)]
    pub user: Option<String>,

    /// Object name pattern to leave out, can be repeated
    #[arg(short = 'x', long)]
    pub exclude: Vec<String>,

    /// Trace dispatch latency to wait out after the workload
    #[arg(long)]
    pub latency_ms: Option<u64>,

    /// Trace with a database scoped session (Azure SQL Database)
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub database_scope: bool,

    /// Verbose output
    #[arg(short = 'v', long, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,

    /// Additional log file that is being logged to
    #[arg(long, default_value = "./sqlcover.log")]
    pub log_file: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Measure a single T-SQL batch, e.g. `EXEC tSQLt.RunAll`.
    Cover {
        command: String,
    },

    /// Measure an external process such as a test runner.
    Workload {
        /// Executable to launch
        #[arg(short, long)]
        exe: PathBuf,

        /// Arguments, split like a shell would
        #[arg(short, long, default_value = "")]
        args: String,

        #[arg(short, long, default_value = None)]
        working_dir: Option<PathBuf>,
    },
}

impl CliArgs {
    /// The configuration file (if any) with command line overrides applied.
    pub fn coverage_config(&self) -> Result<CoverageConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => CoverageConfig::from_file(path)?,
            None => CoverageConfig::new("localhost", ""),
        };
        if let Some(server) = &self.server {
            config.connection.server = server.clone();
        }
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if let Some(user) = &self.user {
            config.connection.user = Some(user.clone());
        }
        config.exclude.extend(self.exclude.iter().cloned());
        if let Some(latency) = self.latency_ms {
            config.dispatch_latency_ms = latency;
        }
        if self.database_scope {
            config.trace_scope = TraceScope::Database;
        }
        if self.verbose {
            config.logging = true;
        }
        config.validate()?;
        Ok(config)
    }
}
