//! Deploy event handling.
//!
//! One invocation per inbound `DeployCommand`: resolve the group directory,
//! render `run.sh`, write it to a unique `runtemp.<id>.sh`, run it, and
//! remove the temp script on every exit path.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ferryx_common::contract::operation::{TEMP_PREFIX, TEMP_SUFFIX};
use ferryx_common::{DeployCommand, RenderContext, render};

use crate::bootstrap::OperationLayout;
use crate::error::{DeployError, RunError};
use crate::runner::ProcessRunner;
use crate::session::DeployEventSink;

/// How a single deploy event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The script ran; the exit code is reported, not judged.
    Completed { exit_code: i32 },
    /// The group has no template; nothing was written or run.
    MissingTemplate,
    /// The worker is shutting down.
    Cancelled,
}

/// Renders and runs the operation script for the worker's group.
pub struct DeployHandler<R> {
    operation_root: PathBuf,
    group: String,
    shell: String,
    runner: R,
}

impl<R: ProcessRunner> DeployHandler<R> {
    /// `group` is the configured group name, never a value taken from the
    /// event.
    pub fn new(
        operation_root: impl Into<PathBuf>,
        group: impl Into<String>,
        shell: impl Into<String>,
        runner: R,
    ) -> Self {
        Self {
            operation_root: operation_root.into(),
            group: group.into(),
            shell: shell.into(),
            runner,
        }
    }

    /// Handles one deploy command.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be read, the temp script
    /// cannot be written, or the shell cannot be started. The temp script is
    /// already gone when this returns, whatever the result.
    pub async fn handle(
        &self,
        command: &DeployCommand,
        cancel: &CancellationToken,
    ) -> Result<DeployOutcome, DeployError> {
        let layout = OperationLayout::for_group(&self.operation_root, &self.group);

        tokio::fs::create_dir_all(&layout.dir)
            .await
            .map_err(|e| DeployError::io("creating operation directory", &layout.dir, e))?;

        let template_exists = tokio::fs::try_exists(&layout.template)
            .await
            .map_err(|e| DeployError::io("checking template", &layout.template, e))?;
        if !template_exists {
            tracing::warn!(
                path = %layout.template.display(),
                deploy_target = %command.target,
                "run.sh not found, skipping deploy"
            );
            return Ok(DeployOutcome::MissingTemplate);
        }

        let template = tokio::fs::read_to_string(&layout.template)
            .await
            .map_err(|e| DeployError::io("reading template", &layout.template, e))?;

        let ctx = RenderContext {
            env: Some(&command.env),
            target: Some(&command.target),
            tag: command.tag.as_deref(),
            group: Some(&self.group),
        };
        let rendered = render(&template, &ctx, command.meta.as_ref());

        if cancel.is_cancelled() {
            return Ok(DeployOutcome::Cancelled);
        }

        let script = TempScript::write(&layout.dir, rendered).await?;

        tracing::info!(
            deploy_target = %command.target,
            tag = command.tag.as_deref().unwrap_or_default(),
            env = %command.env,
            group = %self.group,
            script = %script.path().display(),
            "running operation script"
        );

        let args = [script.path().to_string_lossy().into_owned()];
        let result = self.runner.run(&self.shell, &args, cancel).await;
        script.remove();

        match result {
            Ok(exit_code) => {
                if exit_code == 0 {
                    tracing::info!(
                        deploy_target = %command.target,
                        exit_code,
                        "operation script finished"
                    );
                } else {
                    tracing::warn!(
                        deploy_target = %command.target,
                        exit_code,
                        "operation script finished"
                    );
                }
                Ok(DeployOutcome::Completed { exit_code })
            }
            Err(RunError::Cancelled(_)) => Ok(DeployOutcome::Cancelled),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Temp script ───────────────────────────────────────────────────────────────

/// A rendered script on disk, owned by exactly one handler invocation.
///
/// Dropping it deletes the file; [`TempScript::remove`] does the same but
/// reports failures.
struct TempScript {
    path: TempPath,
}

impl TempScript {
    async fn write(dir: &Path, rendered: String) -> Result<Self, DeployError> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || Self::write_blocking(&dir, &rendered)).await?
    }

    fn write_blocking(dir: &Path, rendered: &str) -> Result<Self, DeployError> {
        let prefix = format!("{TEMP_PREFIX}{}.", Utc::now().format("%Y%m%d%H%M%S%3f"));
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(TEMP_SUFFIX)
            .rand_bytes(8)
            .tempfile_in(dir)
            .map_err(|e| DeployError::io("creating temp script in", dir, e))?;

        file.write_all(rendered.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| DeployError::io("writing temp script", file.path(), e))?;

        let path = file.into_temp_path();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| DeployError::io("marking temp script executable", &*path, e))?;
        }

        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn remove(self) {
        let shown = self.path.display().to_string();
        if let Err(e) = self.path.close()
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %shown, error = %e, "failed to delete temp script");
        }
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Spawns one task per deploy command and logs its result.
///
/// Tasks are tracked so shutdown can wait for in-flight cleanup.
pub struct DeployDispatcher<R> {
    handler: Arc<DeployHandler<R>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl<R: ProcessRunner + 'static> DeployDispatcher<R> {
    #[must_use]
    pub fn new(handler: DeployHandler<R>, shutdown: CancellationToken) -> Self {
        Self {
            handler: Arc::new(handler),
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Starts handling `command` in the background.
    pub fn dispatch(&self, command: DeployCommand) {
        let handler = Arc::clone(&self.handler);
        let cancel = self.shutdown.child_token();
        let target = command.target.clone();

        self.tracker.spawn(async move {
            let task = tokio::spawn(async move { handler.handle(&command, &cancel).await });
            match task.await {
                Ok(Ok(DeployOutcome::Cancelled)) => {
                    tracing::debug!(deploy_target = %target, "deploy aborted by shutdown");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    let err = anyhow::Error::from(e);
                    tracing::error!(
                        deploy_target = %target,
                        error = %format!("{err:#}"),
                        "deploy failed"
                    );
                }
                Err(e) => {
                    tracing::error!(deploy_target = %target, error = %e, "deploy task panicked");
                }
            }
        });
    }

    /// Number of deploy tasks still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stops accepting new tasks and waits for running ones to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl<R: ProcessRunner + 'static> DeployEventSink for DeployDispatcher<R> {
    fn deliver(&self, command: DeployCommand) {
        self.dispatch(command);
    }
}
