use super::{fetch_sources_batched, DatabaseGateway};
use crate::config::CoverageConfig;
use crate::error::GatewayError;
use crate::types::ObjectRef;

use itertools::Itertools;
use log::{debug, log_enabled, Level};
use serde_json::Value;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::Instant;

/// Talks to SQL Server through the `sqlcmd` command line tool.
///
/// Passwords are never put on the command line; `sqlcmd` picks them up from
/// `SQLCMDPASSWORD` in the inherited environment.
pub struct SqlcmdGateway {
    sqlcmd: PathBuf,
    server: String,
    database: String,
    user: Option<String>,
    trust_server_certificate: bool,
}

impl SqlcmdGateway {
    pub fn new(config: &CoverageConfig) -> Self {
        SqlcmdGateway {
            sqlcmd: config.connection.sqlcmd.clone(),
            server: config.connection.server.clone(),
            database: config.database.clone(),
            user: config.connection.user.clone(),
            trust_server_certificate: config.connection.trust_server_certificate,
        }
    }

    fn command(&self, query: &str) -> Command {
        let mut cmd = Command::new(&self.sqlcmd);
        cmd.args(["-S", self.server.as_str(), "-d", self.database.as_str()]);
        match &self.user {
            Some(user) => cmd.args(["-U", user.as_str()]),
            None => cmd.arg("-E"),
        };
        if self.trust_server_certificate {
            cmd.arg("-C");
        }
        // fail on errors, errors to stderr, no headers, unlimited column width, UTF-8 out
        cmd.args(["-b", "-r", "1", "-h", "-1", "-y", "0", "-f", "o:65001"]);
        cmd.arg("-Q").arg(query);
        cmd
    }

    fn run(&self, query: &str) -> Result<String, GatewayError> {
        let start = if log_enabled!(Level::Debug) {
            Some(Instant::now())
        } else {
            None
        };
        let output: Output =
            self.command(query)
                .output()
                .map_err(|source| GatewayError::Spawn {
                    tool: self.sqlcmd.display().to_string(),
                    source,
                })?;
        if let Some(start) = start {
            debug!(
                "sqlcmd finished in {}ms ({})",
                start.elapsed().as_millis(),
                output.status
            );
        }

        if !output.status.success() {
            return Err(GatewayError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        String::from_utf8(output.stdout).map_err(|_| GatewayError::Encoding)
    }
}

impl DatabaseGateway for SqlcmdGateway {
    fn database(&self) -> &str {
        &self.database
    }

    fn execute(&self, command: &str) -> Result<(), GatewayError> {
        let stdout = self.run(command)?;
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            debug!("[sqlcmd] {}", line);
        }
        Ok(())
    }

    fn query_json(&self, query: &str) -> Result<Value, GatewayError> {
        decode_json_output(&self.run(query)?)
    }

    // every call spawns a process and logs in
    fn fetch_object_sources(&self, objects: &[ObjectRef]) -> Vec<Result<String, GatewayError>> {
        fetch_sources_batched(self, objects)
    }
}

/// `FOR JSON` results arrive split over several rows of roughly 2k characters;
/// sqlcmd prints each row on its own line.
pub(crate) fn decode_json_output(stdout: &str) -> Result<Value, GatewayError> {
    let joined = stdout.lines().join("");
    let joined = joined.trim();
    if joined.is_empty() {
        return Ok(Value::Array(vec![]));
    }
    Ok(serde_json::from_str(joined)?)
}
