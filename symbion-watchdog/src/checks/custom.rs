//! Custom command check
//!
//! Runs the configured command through the platform shell with the check
//! timeout as a hard kill deadline. Only the exit code decides the outcome;
//! standard error is kept (truncated) for the failure description.
//!
//! On unix the shell leads its own process group, so a timeout or a
//! cancelled check kills every process the command forked, not just `sh`.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

use super::CheckError;

const MAX_STDERR_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomCheck {
    pub command: String,
    pub expected_exit_code: i32,
}

impl CustomCheck {
    pub(super) async fn run(&self, timeout: Duration) -> Result<(), CheckError> {
        debug!(command = %self.command, ?timeout, "executing check command");

        let mut cmd = shell_command(&self.command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| CheckError::Execution(format!("failed to spawn command: {}", e)))?;

        // Armed until the shell exits on its own. Dropped on timeout or when
        // the check future is cancelled.
        #[cfg(unix)]
        let mut group = GroupKill::new(child.id());

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| CheckError::Timeout(timeout))?
            .map_err(|e| CheckError::Execution(format!("failed to wait for command: {}", e)))?;

        #[cfg(unix)]
        group.disarm();

        let stderr = truncate_utf8(String::from_utf8_lossy(&output.stderr).trim(), MAX_STDERR_BYTES);

        match output.status.code() {
            Some(code) if code == self.expected_exit_code => Ok(()),
            Some(code) => Err(CheckError::UnexpectedExitCode { code, stderr }),
            None => Err(CheckError::Terminated { stderr }),
        }
    }
}

/// SIGKILLs the process group led by the spawned shell when dropped armed
#[cfg(unix)]
struct GroupKill {
    pgid: Option<nix::unistd::Pid>,
}

#[cfg(unix)]
impl GroupKill {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()).map(nix::unistd::Pid::from_raw),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

#[cfg(unix)]
impl Drop for GroupKill {
    fn drop(&mut self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};

        let Some(pgid) = self.pgid.take() else {
            return;
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = pgid.as_raw(), error = %e, "failed to kill check process group"),
        }
    }
}

fn shell_command(command: &str) -> AsyncCommand {
    if cfg!(target_os = "windows") {
        let mut cmd = AsyncCommand::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = AsyncCommand::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

fn truncate_utf8(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
