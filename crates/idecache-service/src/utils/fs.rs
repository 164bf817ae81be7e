use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::SystemTime;

use tempfile::NamedTempFile;

/// Creates `dir` and all of its parents, readable by the current user only.
pub fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// Atomically moves `temp_file` to `path`.
///
/// Readers of `path` only ever see the previous file or the complete new one. The parent
/// directory is recreated if a concurrent cleanup removed it in the meantime.
pub fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<File> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist file"))?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = create_private_dir(parent) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %parent.display(),
                "Failed to create cache directory",
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to persist cache file",
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

/// Returns the modification time of `path`, or `None` if it cannot be read.
pub fn mtime(path: &Path) -> Option<SystemTime> {
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(mtime) => Some(mtime),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "Failed to get mtime");
            None
        }
    }
}
