//! Launching commands on the local machine

use async_process::{ChildStderr, ChildStdout, Stdio};
use futures::stream::Stream;
use futures_lite::io::{AsyncBufReadExt, BufReader, Split};
use std::io::ErrorKind;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::event::{LogSource, OutputLine};
use crate::process::{ExitStatus, LocalProcessHandle};

/// Launcher for executing processes locally
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

/// Output of a command run to completion
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// How the command exited
    pub status: ExitStatus,
    /// Everything written to stdout
    pub stdout: String,
    /// Everything written to stderr
    pub stderr: String,
}

fn map_spawn_error(command: &Command, err: std::io::Error) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::CommandNotFound {
            command: command.get_program().to_string_lossy().into_owned(),
        }
    } else {
        Error::spawn_failed(format!("{}: {}", command.display(), err))
    }
}

impl LocalLauncher {
    /// Create a launcher
    pub fn new() -> Self {
        Self
    }

    /// Spawn a long-running command with piped stdout and stderr.
    ///
    /// The returned stream ends once both pipes close; the handle is used to
    /// wait for or signal the child.
    pub fn launch(&self, command: &Command) -> Result<(OutputStream, LocalProcessHandle)> {
        let mut async_cmd = command.prepare();
        async_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = async_cmd
            .spawn()
            .map_err(|e| map_spawn_error(command, e))?;

        let stdout = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
        let stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));
        let handle = LocalProcessHandle::new(child, command.has_own_process_group());

        debug!("Launched '{}' as pid {}", command.display(), handle.pid());

        Ok((OutputStream { stdout, stderr }, handle))
    }

    /// Run a command to completion and capture its output
    pub async fn capture(&self, command: &Command) -> Result<CapturedOutput> {
        let mut async_cmd = command.prepare();
        async_cmd.stdin(Stdio::null());

        let output = async_cmd
            .output()
            .await
            .map_err(|e| map_spawn_error(command, e))?;

        Ok(CapturedOutput {
            status: output.status.into(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Stream of lines read from a child's stdout and stderr.
///
/// Lines are split on raw bytes and decoded lossily, so output that is not
/// valid UTF-8 never closes a pipe.
pub struct OutputStream {
    stdout: Option<Split<BufReader<ChildStdout>>>,
    stderr: Option<Split<BufReader<ChildStderr>>>,
}

fn decode(mut raw: Vec<u8>) -> String {
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    String::from_utf8(raw).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

impl Stream for OutputStream {
    type Item = OutputLine;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        if let Some(stdout) = &mut this.stdout {
            match Pin::new(stdout).poll_next(cx) {
                Poll::Ready(Some(Ok(raw))) => {
                    return Poll::Ready(Some(OutputLine::new(LogSource::Stdout, decode(raw))));
                }
                // An I/O error ends the pipe just like EOF
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.stdout = None,
                Poll::Pending => {}
            }
        }

        if let Some(stderr) = &mut this.stderr {
            match Pin::new(stderr).poll_next(cx) {
                Poll::Ready(Some(Ok(raw))) => {
                    return Poll::Ready(Some(OutputLine::new(LogSource::Stderr, decode(raw))));
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.stderr = None,
                Poll::Pending => {}
            }
        }

        if this.stdout.is_none() && this.stderr.is_none() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}
