//! Operation directory bootstrap, run once before the session starts.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use ferryx_common::contract::operation::TEMPLATE_FILE;
use ferryx_common::{DEFAULT_TEMPLATE, sanitize_group};

/// Paths of one group's operation directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationLayout {
    pub dir: PathBuf,
    pub template: PathBuf,
}

impl OperationLayout {
    /// Layout for `group` under `root`. The directory name is always the
    /// sanitized group.
    #[must_use]
    pub fn for_group(root: &Path, group: &str) -> Self {
        let dir = root.join(sanitize_group(group));
        let template = dir.join(TEMPLATE_FILE);
        Self { dir, template }
    }
}

/// What [`ensure_operation`] had to create.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub created_dir: bool,
    pub created_template: bool,
}

/// Ensures the operation directory and a default template exist for `group`.
///
/// An existing template is never touched.
///
/// # Errors
///
/// Returns an error if the directory or the default template cannot be
/// created. The worker cannot serve deploys without them.
pub fn ensure_operation(root: &Path, group: &str) -> Result<(OperationLayout, BootstrapReport)> {
    let layout = OperationLayout::for_group(root, group);
    let mut report = BootstrapReport::default();

    if !layout.dir.is_dir() {
        std::fs::create_dir_all(&layout.dir)
            .with_context(|| format!("creating operation directory {}", layout.dir.display()))?;
        report.created_dir = true;
        tracing::info!(dir = %layout.dir.display(), "[operation] created");
    }

    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&layout.template)
    {
        Ok(mut file) => {
            file.write_all(DEFAULT_TEMPLATE.as_bytes())
                .with_context(|| format!("writing default template {}", layout.template.display()))?;
            report.created_template = true;
            tracing::info!(path = %layout.template.display(), "[operation] run.sh created");
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(e).with_context(|| {
                format!("creating default template {}", layout.template.display())
            });
        }
    }

    Ok((layout, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_directory_and_default_template() {
        let root = tempfile::tempdir().unwrap();
        let (layout, report) = ensure_operation(root.path(), "web").unwrap();

        assert_eq!(layout.dir, root.path().join("web"));
        assert!(report.created_dir);
        assert!(report.created_template);
        let content = std::fs::read_to_string(&layout.template).unwrap();
        assert_eq!(content, DEFAULT_TEMPLATE);
    }

    #[test]
    fn creates_missing_parents() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        let (layout, _) = ensure_operation(&nested, "web").unwrap();
        assert!(layout.template.is_file());
    }

    #[test]
    fn keeps_operator_template() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("web");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("run.sh"), "echo custom").unwrap();

        let (layout, report) = ensure_operation(root.path(), "web").unwrap();
        assert!(!report.created_dir);
        assert!(!report.created_template);
        assert_eq!(std::fs::read_to_string(layout.template).unwrap(), "echo custom");
    }

    #[test]
    fn uses_sanitized_group_for_paths() {
        let root = tempfile::tempdir().unwrap();
        let (layout, _) = ensure_operation(root.path(), "../escape").unwrap();
        assert_eq!(layout.dir, root.path().join("___escape"));
        assert!(layout.dir.starts_with(root.path()));
    }

    #[test]
    fn is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        ensure_operation(root.path(), "web").unwrap();
        let (_, report) = ensure_operation(root.path(), "web").unwrap();
        assert_eq!(report, BootstrapReport::default());
    }

    #[test]
    fn fails_when_root_is_a_file() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("occupied");
        std::fs::write(&file, "x").unwrap();
        assert!(ensure_operation(&file, "web").is_err());
    }
}
