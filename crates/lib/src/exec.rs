//! External command execution.
//!
//! The pipeline shells out for the operations the platform already does
//! well: archiving a directory (`tar`), applying unified diffs (`patch`),
//! recursive copies (`cp`) and version control (`git`). Commands either run
//! to completion with captured output ([`run`]) or stream their stdout
//! incrementally ([`popen`]). A non-zero exit always surfaces as a
//! structured error carrying the captured stderr.

use std::ffi::{OsStr, OsString};
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use thiserror::Error;
use tracing::debug;

/// Errors from external command invocations.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command could not be started at all.
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The command ran and exited non-zero.
    #[error("`{command}` exited with status {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// I/O failure while talking to the child process.
    #[error("i/o error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
}

/// Run a command to completion and return its stdout.
///
/// Stdin is closed; stdout and stderr are captured. A non-zero exit maps to
/// [`ExecError::Failed`] with the trimmed stderr.
pub fn run<I, S>(program: &str, args: I, chdir: Option<&Path>) -> Result<Vec<u8>, ExecError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let command = render(program, &args);
    debug!(command = %command, chdir = ?chdir, "running external command");

    let mut cmd = Command::new(program);
    cmd.args(&args);
    if let Some(dir) = chdir {
        cmd.current_dir(dir);
    }
    let output = cmd.output().map_err(|source| ExecError::Spawn {
        command: command.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(ExecError::Failed {
            command,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Spawn a command and return a live stream over its stdout.
///
/// The child is reaped when the stream reaches end of file; a non-zero exit
/// is reported at that point as an `io::Error` wrapping
/// [`ExecError::Failed`]. Dropping an unfinished stream kills the child, so
/// a cancelled build does not leave processes behind.
pub fn popen<I, S>(program: &str, args: I, chdir: Option<&Path>) -> Result<ChildStream, ExecError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let command = render(program, &args);
    debug!(command = %command, chdir = ?chdir, "streaming external command");

    let mut cmd = Command::new(program);
    cmd.args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = chdir {
        cmd.current_dir(dir);
    }
    let child = cmd.spawn().map_err(|source| ExecError::Spawn {
        command: command.clone(),
        source,
    })?;
    Ok(ChildStream {
        child,
        command,
        finished: false,
    })
}

/// Streaming stdout of a spawned child process.
pub struct ChildStream {
    child: Child,
    command: String,
    finished: bool,
}

impl Read for ChildStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let Some(stdout) = self.child.stdout.as_mut() else {
            return Ok(0);
        };
        let n = stdout.read(buf)?;
        if n == 0 {
            self.finished = true;
            let mut stderr = String::new();
            if let Some(mut pipe) = self.child.stderr.take() {
                pipe.read_to_string(&mut stderr).ok();
            }
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::other(ExecError::Failed {
                    command: self.command.clone(),
                    status: status.code().unwrap_or(-1),
                    stderr: stderr.trim().to_string(),
                }));
            }
        }
        Ok(n)
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn render(program: &str, args: &[OsString]) -> String {
    let mut out = String::from(program);
    for arg in args {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}
