use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheEntry, CacheError};
use crate::process::{Invocation, ProcessRunner};
use crate::utils::fs::create_private_dir;

/// Regenerates tags files for a directory.
pub trait TagsBuilder: Send + Sync + fmt::Debug {
    /// Rebuilds the tags for `directory`, descending into subdirectories if `recursive`.
    ///
    /// The tool is killed once `cancel` is cancelled.
    fn build(
        &self,
        directory: &Path,
        recursive: bool,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, CacheEntry<()>>;
}

/// Runs ctags directly, writing into the per-project tags cache.
///
/// The tags for `<workdir>/<dir>` end up in `<tags_dir>/<dir>/tags`, with paths relative to
/// `<workdir>/<dir>`. ctags runs in that directory.
#[derive(Debug, Clone)]
pub struct CtagsBuilder {
    runner: Arc<dyn ProcessRunner>,
    program: String,
    workdir: PathBuf,
    tags_dir: PathBuf,
}

impl CtagsBuilder {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        program: impl Into<String>,
        workdir: PathBuf,
        tags_dir: PathBuf,
    ) -> Self {
        Self {
            runner,
            program: program.into(),
            workdir,
            tags_dir,
        }
    }

    fn invocation(&self, directory: &Path, recursive: bool) -> CacheEntry<(Invocation, PathBuf)> {
        let relative = directory.strip_prefix(&self.workdir).map_err(|_| {
            CacheError::InvalidPath(format!(
                "{} is outside of {}",
                directory.display(),
                self.workdir.display()
            ))
        })?;

        let destination_dir = self.tags_dir.join(relative);
        let destination = destination_dir.join("tags");

        let mut invocation = Invocation::new(self.program.as_str())
            .arg("-f")
            .arg(destination.to_string_lossy())
            .arg("--tag-relative=no");
        if recursive {
            invocation = invocation.arg("--recurse");
        }
        let invocation = invocation.arg(".").cwd(directory);

        Ok((invocation, destination_dir))
    }
}

impl TagsBuilder for CtagsBuilder {
    fn build(
        &self,
        directory: &Path,
        recursive: bool,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, CacheEntry<()>> {
        let prepared = self.invocation(directory, recursive);
        let runner = Arc::clone(&self.runner);

        Box::pin(async move {
            let (invocation, destination_dir) = prepared?;
            let invocation = invocation.cancel_with(cancel);
            create_private_dir(&destination_dir)?;

            tracing::debug!(%invocation, "Building tags");
            let output = runner.run(invocation).await?;
            if !output.success() {
                tracing::warn!(status = ?output.status, "ctags exited unsuccessfully");
            }
            Ok(())
        })
    }
}

/// Runs `make ctags`, for build systems that know how to generate their own tags.
#[derive(Debug, Clone)]
pub struct MakeTagsBuilder {
    runner: Arc<dyn ProcessRunner>,
    program: String,
}

impl MakeTagsBuilder {
    pub fn new(runner: Arc<dyn ProcessRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }
}

impl TagsBuilder for MakeTagsBuilder {
    fn build(
        &self,
        directory: &Path,
        _recursive: bool,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, CacheEntry<()>> {
        let invocation = Invocation::new(self.program.as_str())
            .arg("ctags")
            .cwd(directory)
            .cancel_with(cancel);
        let runner = Arc::clone(&self.runner);

        Box::pin(async move {
            tracing::debug!(%invocation, "Building tags");
            let output = runner.run(invocation).await?;
            if !output.success() {
                tracing::warn!(status = ?output.status, "make ctags exited unsuccessfully");
            }
            Ok(())
        })
    }
}
