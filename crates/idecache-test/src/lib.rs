//! Helpers for testing the caches and services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], hold the returned [`TempDir`] for the entire test. Makecache and
//!    tags directories are created lazily, so a directory dropped too early is silently
//!    recreated outside of the cleanup guard. Assign it to a variable in the test function,
//!    e.g. `let cache_dir = test::tempdir();`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `idecache` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("idecache_service=trace,idecache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `files` below `root`, creating parent directories as needed.
///
/// Paths are relative to `root`. Returns the absolute paths of the written files in the given
/// order.
///
/// # Panics
///
/// Panics if any of the files cannot be written.
pub fn write_tree(root: &Path, files: &[(&str, &str)]) -> Vec<PathBuf> {
    files
        .iter()
        .map(|(relative, contents)| {
            let path = root.join(relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, contents).unwrap();
            path
        })
        .collect()
}
