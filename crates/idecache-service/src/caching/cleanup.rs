use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::config::Config;
use crate::makecache::TEMP_MARKER;

/// Temporary makecache files younger than this may still be written by another process.
const MIN_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Entry function for the cleanup command.
///
/// Deletes leftover temporary makecache files of constructions that never finished. If
/// `dry_run` is `true`, the files are only logged. Returns the number of affected files.
pub fn cleanup(config: &Config, dry_run: bool) -> Result<usize> {
    let directory = config.cache_path("makecache");
    cleanup_dir(&directory, SystemTime::now(), dry_run)
        .with_context(|| format!("failed to clean up {}", directory.display()))
}

fn cleanup_dir(directory: &Path, now: SystemTime, dry_run: bool) -> Result<usize> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        if !name.to_string_lossy().contains(TEMP_MARKER) {
            continue;
        }

        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age < MIN_TEMP_AGE {
            tracing::debug!(path = %entry.path().display(), "Keeping recent temporary makecache");
            continue;
        }

        if dry_run {
            tracing::info!(path = %entry.path().display(), "Would remove temporary makecache");
        } else {
            tracing::info!(path = %entry.path().display(), "Removing temporary makecache");
            match fs::remove_file(entry.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        removed += 1;
    }

    metric!(counter("caches.cleanup.removed") += removed as i64, "dry_run" => &dry_run.to_string());
    Ok(removed)
}
