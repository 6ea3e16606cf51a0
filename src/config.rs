use crate::error::ConfigError;
use crate::filter::ExcludeFilter;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_server() -> String {
    "localhost".to_string()
}

fn default_sqlcmd() -> PathBuf {
    PathBuf::from("sqlcmd")
}

fn default_latency_ms() -> u64 {
    1000
}

/// Where the execution trace lives on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceScope {
    /// Server wide session filtered on the target database
    #[default]
    Server,
    /// Database scoped session (Azure SQL Database)
    Database,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_server")]
    pub server: String,

    /// SQL login; Windows/trusted authentication when absent
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default = "default_sqlcmd")]
    pub sqlcmd: PathBuf,

    #[serde(default)]
    pub trust_server_certificate: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            server: default_server(),
            user: None,
            sqlcmd: default_sqlcmd(),
            trust_server_certificate: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageConfig {
    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Object name patterns left out of the measurement
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Forward diagnostics to the logger as they happen
    #[serde(default)]
    pub logging: bool,

    /// How long the server may sit on captured events before dispatching them
    #[serde(default = "default_latency_ms")]
    pub dispatch_latency_ms: u64,

    #[serde(default)]
    pub trace_scope: TraceScope,
}

impl CoverageConfig {
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        CoverageConfig {
            database: database.into(),
            connection: ConnectionConfig {
                server: server.into(),
                ..ConnectionConfig::default()
            },
            exclude: vec![],
            logging: false,
            dispatch_latency_ms: default_latency_ms(),
            trace_scope: TraceScope::default(),
        }
    }

    /// Parses without validating, so command line flags can still fill gaps.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::Invalid("no database given".to_string()));
        }
        if self.connection.server.trim().is_empty() {
            return Err(ConfigError::Invalid("no server given".to_string()));
        }
        if self.dispatch_latency_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatch latency must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }

    /// The latency the server session is actually created with. The server
    /// only takes whole seconds, so this rounds up; waiting any less after the
    /// workload can miss events.
    pub fn effective_dispatch_latency(&self) -> Duration {
        Duration::from_secs(self.dispatch_latency_ms.div_ceil(1000).max(1))
    }

    pub fn exclude_filter(&self) -> ExcludeFilter {
        ExcludeFilter::new(&self.exclude)
    }
}
