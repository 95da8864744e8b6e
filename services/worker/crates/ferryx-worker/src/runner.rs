//! Subprocess execution with line-by-line output forwarding.
//!
//! `ProcessRunner` is the port the deploy handler depends on; the production
//! implementation uses tokio, test doubles can record invocations without
//! spawning anything.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use crate::error::RunError;

/// Tracing target for forwarded script output.
pub const SCRIPT_LOG_TARGET: &str = "ferryx::script";

/// How long output forwarding may lag behind process exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs an external program to completion and reports its exit code.
///
/// The exit code is returned as-is; judging it is up to the caller.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// # Errors
    ///
    /// Returns [`RunError::Spawn`] if the program cannot be started and
    /// [`RunError::Cancelled`] if `cancel` fires before it exits.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<i32, RunError>;
}

/// Production runner. The child is not killed on cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<i32, RunError> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = tokio::spawn(forward_lines(
            child.stdout.take(),
            Stream::Stdout,
            program.to_string(),
        ));
        let stderr = tokio::spawn(forward_lines(
            child.stderr.take(),
            Stream::Stderr,
            program.to_string(),
        ));

        // Exit of the child, not EOF on its pipes: background jobs started by
        // the script may hold them open long after it returns.
        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| RunError::Wait {
                program: program.to_string(),
                source,
            })?,
            () = cancel.cancelled() => return Err(RunError::Cancelled(program.to_string())),
        };

        let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
            let _ = stdout.await;
            let _ = stderr.await;
        })
        .await;
        if drained.is_err() {
            tracing::debug!(program, "output still open after exit, forwarding in background");
        }

        Ok(exit_code(status))
    }
}

/// Forwards each line of `reader` to tracing as soon as it is complete.
/// Invalid UTF-8 is replaced rather than aborting the pump, so the child
/// never blocks on a full pipe.
async fn forward_lines<R>(reader: Option<R>, stream: Stream, program: String)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                match stream {
                    Stream::Stdout => tracing::info!(target: SCRIPT_LOG_TARGET, program, "{line}"),
                    Stream::Stderr => tracing::warn!(target: SCRIPT_LOG_TARGET, program, "{line}"),
                }
            }
            Err(e) => {
                tracing::warn!(program, error = %e, "stopped reading script output");
                break;
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
