//! External workload processes.

use crate::error::WorkloadError;

use log::{error, info};
#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, ExitStatus};
use std::time::Instant;

/// Exit code reported when the process died without one and no signal is known.
const UNKNOWN_EXIT: i32 = 100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadRun {
    pub exit_code: i32,
    pub time_ms: u64,
}

impl WorkloadRun {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait ProcessRunner: Send + Sync {
    /// Blocks until the process exits. Timeouts are the runner's business.
    fn run(
        &self,
        executable: &Path,
        arguments: &str,
        working_dir: Option<&Path>,
    ) -> Result<WorkloadRun, WorkloadError>;
}

/// Runs the workload with inherited stdio so its output shows up as usual.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRunner;

impl ProcessRunner for CommandRunner {
    fn run(
        &self,
        executable: &Path,
        arguments: &str,
        working_dir: Option<&Path>,
    ) -> Result<WorkloadRun, WorkloadError> {
        let args = shellwords::split(arguments)
            .map_err(|_| WorkloadError::Arguments(arguments.to_string()))?;
        let cmd = &mut Command::new(executable);
        cmd.args(&args);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let start = Instant::now();
        let status = cmd.status().map_err(|source| WorkloadError::Spawn {
            executable: executable.to_path_buf(),
            source,
        })?;
        let duration = start.elapsed();

        let exit_code = exit_code(status);
        if !status.success() {
            error!(
                "Workload failed ({}): {:?} {:?}",
                status, executable, args
            );
        } else {
            info!("Workload finished [{}] ({:?})", status, executable);
        }

        Ok(WorkloadRun {
            exit_code,
            time_ms: duration.as_millis().try_into().unwrap_or(u64::MAX),
        })
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(status.signal().unwrap_or(UNKNOWN_EXIT))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(UNKNOWN_EXIT)
}
