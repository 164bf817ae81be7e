use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::Mmap;

use crate::caching::{CacheEntry, CacheError};
use crate::process::{Invocation, ProcessRunner};
use crate::utils::fs::{create_private_dir, persist_tempfile};
use crate::utils::pool::WorkerPool;

/// Infix of temporary makecache files, `<project-id>.makecache.tmp-<unix-time><random>`.
pub const TEMP_MARKER: &str = ".makecache.tmp-";

/// A memory-mapped, UTF-8 validated `make -p -n -s` database.
#[derive(Debug)]
pub struct MakeSnapshot {
    path: PathBuf,
    mmap: Mmap,
}

impl MakeSnapshot {
    /// Maps the database at `path` and validates it.
    ///
    /// An empty file or one that is not valid UTF-8 is [`CacheError::Malformed`].
    pub fn open(path: &Path) -> CacheEntry<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(CacheError::Malformed("makecache is empty".into()));
        }

        // SAFETY: the file is only ever replaced by renaming a new file over it, which leaves
        // this mapping intact.
        let mmap = unsafe { Mmap::map(&file)? };
        if let Err(e) = std::str::from_utf8(&mmap) {
            return Err(CacheError::Malformed(format!(
                "makecache contains invalid UTF-8: {e}"
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: validated in `open`, and the mapping is read-only.
        unsafe { std::str::from_utf8_unchecked(&self.mmap) }
    }
}

/// Where and how a makecache is built.
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub make_program: String,
    /// The Makefile. `make` runs in its directory.
    pub makefile: PathBuf,
    /// Directory holding the makecache files of all projects.
    pub cache_dir: PathBuf,
    pub project_id: String,
}

impl SnapshotRequest {
    pub fn cache_file(&self) -> PathBuf {
        self.cache_dir.join(format!("{}.makecache", self.project_id))
    }
}

/// Runs `make -p -n -s` into a temporary file, moves it into place and maps it.
///
/// Other processes reading the makecache only ever see a complete file.
pub async fn build_snapshot(
    request: SnapshotRequest,
    runner: Arc<dyn ProcessRunner>,
    pool: WorkerPool,
) -> CacheEntry<MakeSnapshot> {
    let makefile_dir = match request.makefile.parent() {
        Some(dir) if request.makefile.is_file() => dir.to_path_buf(),
        _ => {
            return Err(CacheError::Construction(format!(
                "no Makefile at {}",
                request.makefile.display()
            )));
        }
    };

    create_private_dir(&request.cache_dir).map_err(|e| {
        CacheError::Construction(format!(
            "failed to create {}: {e}",
            request.cache_dir.display()
        ))
    })?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let temp_file = tempfile::Builder::new()
        .prefix(&format!("{}{TEMP_MARKER}{now}", request.project_id))
        .tempfile_in(&request.cache_dir)
        .map_err(|e| {
            CacheError::Construction(format!("failed to create temporary makecache: {e}"))
        })?;
    let stdout = temp_file.as_file().try_clone()?;

    let invocation = Invocation::new(request.make_program.as_str())
        .args(["-p", "-n", "-s"])
        .cwd(&makefile_dir)
        .stdout_to(stdout);
    tracing::debug!(%invocation, cwd = %makefile_dir.display(), "Building makecache");

    let output = pool.run(runner.run(invocation)).await??;
    if !output.success() {
        // make -p still dumps its database when a rule fails
        tracing::debug!(status = ?output.status, "make exited unsuccessfully");
    }

    let cache_file = request.cache_file();
    pool.spawn_blocking(move || {
        persist_tempfile(temp_file, &cache_file)?;
        let snapshot = MakeSnapshot::open(&cache_file)?;
        tracing::debug!(
            path = %cache_file.display(),
            size = snapshot.len(),
            "Makecache ready"
        );
        Ok(snapshot)
    })
    .await?
}
