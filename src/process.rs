//! Subprocess execution with captured, line-oriented output

use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{CiError, Result};

/// Exit code reported when a process was terminated by a signal.
pub const SIGNAL_EXIT_CODE: i32 = -1;

/// Combined output of a finished process
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub exit_code: i32,
    /// stdout and stderr lines, in the order they were read.
    ///
    /// Not byte-exact: every line ends in `\n` (a trailing `\r` is dropped,
    /// as is the distinction of a missing final newline) and invalid UTF-8
    /// is replaced with U+FFFD.
    pub output: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs `command` through `sh -c` inside `cwd` and waits for it to exit.
///
/// The shell leads its own process group. If the returned future is dropped
/// before the command exits (e.g. by `tokio::time::timeout`), the whole group
/// is killed, not just the shell.
///
/// Both output streams are drained to the end; every line is handed to
/// `on_line` before being appended to the captured output. A process that
/// cannot be started, or whose streams or exit status cannot be read, is a
/// [`CiError::ProcessFailure`].
pub async fn run_captured<F>(command: &str, cwd: &Path, mut on_line: F) -> Result<CapturedOutput>
where
    F: FnMut(&str),
{
    debug!("Running (cwd = {:?}): {}", cwd, command);
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| failure(command, format!("failed to start: {}", e)))?;
    let mut group = ProcessGroup::of(&child);

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| failure(command, "stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| failure(command, "stderr was not captured"))?;
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);

    let mut output = String::new();
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();
    let mut out_done = false;
    let mut err_done = false;

    while !(out_done && err_done) {
        tokio::select! {
            read = stdout.read_until(b'\n', &mut out_buf), if !out_done => {
                let read = read.map_err(|e| failure(command, format!("failed to read stdout: {}", e)))?;
                out_done = read == 0;
                take_line(&mut out_buf, &mut output, &mut on_line);
            }
            read = stderr.read_until(b'\n', &mut err_buf), if !err_done => {
                let read = read.map_err(|e| failure(command, format!("failed to read stderr: {}", e)))?;
                err_done = read == 0;
                take_line(&mut err_buf, &mut output, &mut on_line);
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| failure(command, format!("wait interrupted: {}", e)))?;
    group.release();

    let exit_code = status.code().unwrap_or_else(|| {
        warn!("'{}' was terminated by a signal", command);
        SIGNAL_EXIT_CODE
    });
    debug!("'{}' exited with {}", command, exit_code);

    Ok(CapturedOutput { exit_code, output })
}

/// Moves a complete (or final partial) line out of `buf`.
fn take_line<F: FnMut(&str)>(buf: &mut Vec<u8>, output: &mut String, on_line: &mut F) {
    if buf.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(buf);
    let line = text.trim_end_matches(['\n', '\r']);
    on_line(line);
    output.push_str(line);
    output.push('\n');
    buf.clear();
}

/// Kills the process group led by a command's shell when dropped, unless released.
struct ProcessGroup {
    pgid: Option<libc::pid_t>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|id| libc::pid_t::try_from(id).ok()),
        }
    }

    fn release(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!(pgid, "Killing abandoned process group");
            // SAFETY: killpg only sends a signal to the group this command leads.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

fn failure(command: &str, message: impl Into<String>) -> CiError {
    CiError::ProcessFailure {
        command: command.to_string(),
        message: message.into(),
    }
}
