use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::Instrument;

use crate::caching::{CacheEntry, CacheError, CacheName, Cacher};
use crate::config::Config;
use crate::process::{Invocation, ProcessRunner};
use crate::utils::pool::WorkerPool;
use crate::utils::project::project_id;

use super::flags::{FAKE_CC, FAKE_CXX, FAKE_VALAC, extract_flags};
use super::snapshot::{MakeSnapshot, SnapshotRequest, build_snapshot};
use super::targets::{MakeTarget, RegexTargetScanner, TargetScanner};

/// Extensions clang can make sense of without any build flags.
const CLANGABLE_EXTENSIONS: &[&str] = &["c", "h", "cc", "hh", "cpp", "hpp", "cxx", "hxx"];

const NO_TARGET: &str = "file is not included in any target";

type SharedSnapshot = Shared<BoxFuture<'static, CacheEntry<Arc<MakeSnapshot>>>>;

struct Inner {
    makefile: PathBuf,
    makefile_dir: PathBuf,
    make_program: String,
    runner: Arc<dyn ProcessRunner>,
    pool: WorkerPool,
    snapshot: SharedSnapshot,
    ready: Arc<AtomicBool>,
    llvm_flag: Shared<BoxFuture<'static, Option<String>>>,
    scanner: Arc<dyn TargetScanner>,
    targets: Cacher<String, Arc<[MakeTarget]>>,
    flags: Cacher<String, Arc<[String]>>,
}

/// Resolves compiler flags and make targets for the sources of a Makefile project.
///
/// On construction, the make database (`make -p -n -s`) is dumped into the makecache directory
/// in the background, and clang is asked for its builtin include directory. Every lookup waits
/// for the database, so lookups may be issued right away.
///
/// Results are memoized per path relative to the Makefile's directory. Nothing watches the
/// project for changes; [`clear`](Self::clear) drops everything that was resolved.
///
/// Must be created from within a tokio runtime.
#[derive(Clone)]
pub struct BuildFlagsResolver {
    inner: Arc<Inner>,
}

impl fmt::Debug for BuildFlagsResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildFlagsResolver")
            .field("makefile", &self.inner.makefile)
            .field("ready", &self.is_ready())
            .field("targets", &self.inner.targets)
            .field("flags", &self.inner.flags)
            .finish()
    }
}

impl BuildFlagsResolver {
    pub fn new(config: &Config, makefile: PathBuf, runner: Arc<dyn ProcessRunner>) -> Self {
        Self::with_scanner(config, makefile, runner, Arc::new(RegexTargetScanner))
    }

    pub fn with_scanner(
        config: &Config,
        makefile: PathBuf,
        runner: Arc<dyn ProcessRunner>,
        scanner: Arc<dyn TargetScanner>,
    ) -> Self {
        let makefile = std::path::absolute(&makefile).unwrap_or(makefile);
        let makefile_dir = makefile
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let pool = WorkerPool::new(config.workers);
        let ready = Arc::new(AtomicBool::new(false));

        let request = SnapshotRequest {
            make_program: config.make.make_program.clone(),
            makefile: makefile.clone(),
            cache_dir: config.cache_path("makecache"),
            project_id: project_id(&makefile_dir),
        };
        let snapshot =
            spawn_snapshot(request, Arc::clone(&runner), pool.clone(), Arc::clone(&ready));

        let llvm_flag = {
            let handle = tokio::spawn(discover_llvm_flag(
                Arc::clone(&runner),
                pool.clone(),
                config.make.clang_program.clone(),
            ));
            async move { handle.await.ok().flatten() }.boxed().shared()
        };

        let inner = Inner {
            makefile,
            makefile_dir,
            make_program: config.make.make_program.clone(),
            runner,
            pool,
            snapshot,
            ready,
            llvm_flag,
            scanner,
            targets: Cacher::new(CacheName::MakeTargets, config.caches.make_targets),
            flags: Cacher::new(CacheName::MakeFlags, config.caches.make_flags),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn makefile(&self) -> &Path {
        &self.inner.makefile
    }

    /// Whether the make database has been built and mapped.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Waits for the make database. Fails if it could not be built.
    pub async fn wait_ready(&self) -> CacheEntry<()> {
        self.inner.snapshot.clone().await.map(|_| ())
    }

    /// Returns the make targets whose rules reference `file`.
    ///
    /// `file` is either relative to the Makefile's directory or an absolute path inside it.
    /// A file no rule references is [`CacheError::NotFound`] and remembered as such.
    pub async fn get_targets(&self, file: &Path) -> CacheEntry<Arc<[MakeTarget]>> {
        let relative = self.inner.relative_path(file)?;
        Arc::clone(&self.inner).get_targets(relative).await
    }

    /// Returns the compiler flags `file` is built with.
    ///
    /// C-family sources without any target still get clang's builtin include directory.
    pub async fn get_flags(&self, file: &Path) -> CacheEntry<Arc<[String]>> {
        let relative = self.inner.relative_path(file)?;
        let inner = Arc::clone(&self.inner);
        self.inner
            .flags
            .compute_memoized(relative, move |relative| inner.resolve_flags(relative))
            .await
    }

    /// Forgets all resolved targets and flags.
    ///
    /// The make database itself is kept.
    pub fn clear(&self) {
        self.inner.targets.invalidate_all();
        self.inner.flags.invalidate_all();
    }
}

fn spawn_snapshot(
    request: SnapshotRequest,
    runner: Arc<dyn ProcessRunner>,
    pool: WorkerPool,
    ready: Arc<AtomicBool>,
) -> SharedSnapshot {
    let span = tracing::info_span!("makecache", makefile = %request.makefile.display());
    let handle = tokio::spawn(
        async move {
            let result = build_snapshot(request, runner, pool).await.map(Arc::new);
            match &result {
                Ok(_) => ready.store(true, Ordering::Release),
                Err(err) => tracing::error!(error = %err, "Failed to build makecache"),
            }
            result
        }
        .instrument(span),
    );

    async move {
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(CacheError::from_std_error(e)),
        }
    }
    .boxed()
    .shared()
}

/// Asks clang where its builtin headers live. Missing clang just means no flag.
async fn discover_llvm_flag(
    runner: Arc<dyn ProcessRunner>,
    pool: WorkerPool,
    clang_program: String,
) -> Option<String> {
    let invocation = Invocation::new(clang_program).arg("-print-file-name=include");
    let output = match pool.run(runner.run(invocation)).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::debug!(error = &e as &dyn std::error::Error, "Failed to query clang");
            return None;
        }
        Err(_) => return None,
    };

    let stdout = output.stdout_lossy();
    let path = stdout.trim();
    if path.is_empty() || path == "include" {
        None
    } else {
        Some(format!("-I{path}"))
    }
}

/// The path make sees as changed when it runs in `subdir`.
///
/// Paths inside `subdir` are made relative to it, anything else is passed on unchanged.
fn changed_path<'a>(subdir: Option<&str>, relative: &'a str) -> &'a str {
    subdir
        .and_then(|subdir| Path::new(relative).strip_prefix(subdir).ok())
        .and_then(Path::to_str)
        .unwrap_or(relative)
}

fn is_clangable(relative_path: &str) -> bool {
    Path::new(relative_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| CLANGABLE_EXTENSIONS.contains(&ext))
}

/// Groups target names by subdir, keeping the order in which subdirs first appear.
fn group_by_subdir(targets: &[MakeTarget]) -> Vec<(Option<&str>, Vec<&str>)> {
    let mut groups: Vec<(Option<&str>, Vec<&str>)> = Vec::new();
    for target in targets {
        let subdir = target.subdir.as_deref();
        match groups.iter_mut().find(|(s, _)| *s == subdir) {
            Some((_, names)) => names.push(&target.target),
            None => groups.push((subdir, vec![&target.target])),
        }
    }
    groups
}

impl Inner {
    /// Normalizes `file` to a `/`-separated path relative to the Makefile's directory.
    fn relative_path(&self, file: &Path) -> CacheEntry<String> {
        let invalid = || CacheError::InvalidPath(file.display().to_string());

        let relative = if file.is_absolute() {
            file.strip_prefix(&self.makefile_dir).map_err(|_| invalid())?
        } else {
            file
        };

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str().ok_or_else(invalid)?),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid());
                }
            }
        }
        if parts.is_empty() {
            return Err(invalid());
        }
        Ok(parts.join("/"))
    }

    async fn get_targets(self: Arc<Self>, relative: String) -> CacheEntry<Arc<[MakeTarget]>> {
        let inner = Arc::clone(&self);
        self.targets
            .compute_memoized(relative, move |relative| inner.scan_targets(relative))
            .await
    }

    async fn scan_targets(self: Arc<Self>, relative: String) -> CacheEntry<Arc<[MakeTarget]>> {
        let snapshot = self.snapshot.clone().await?;
        let scanner = Arc::clone(&self.scanner);
        let targets = self
            .pool
            .spawn_blocking(move || {
                metric!(counter("makecache.targets.scan") += 1);
                scanner.scan(snapshot.as_str(), &relative)
            })
            .await??;

        if targets.is_empty() {
            return Err(CacheError::not_found(NO_TARGET));
        }
        tracing::trace!(count = targets.len(), "Found make targets");
        Ok(targets.into())
    }

    async fn resolve_flags(self: Arc<Self>, relative: String) -> CacheEntry<Arc<[String]>> {
        let targets = match Arc::clone(&self).get_targets(relative.clone()).await {
            Ok(targets) => targets,
            Err(CacheError::NotFound(reason)) => {
                if !is_clangable(&relative) {
                    return Err(CacheError::NotFound(reason));
                }
                let llvm_flag = self.llvm_flag.clone().await;
                return Ok(llvm_flag.into_iter().collect());
            }
            Err(err) => return Err(err),
        };

        for (subdir, names) in group_by_subdir(&targets) {
            let output = self.dry_run(subdir, &relative, &names).await?;
            let include_base = match subdir {
                Some(subdir) => self.makefile_dir.join(subdir),
                None => self.makefile_dir.clone(),
            };
            let parsed =
                extract_flags(&output, Some(include_base.as_path()), subdir.unwrap_or(""));
            if let Some(parsed) = parsed {
                let llvm_flag = self.llvm_flag.clone().await;
                let mut flags = Vec::with_capacity(parsed.len() + 1);
                flags.extend(llvm_flag);
                flags.extend(parsed);
                return Ok(flags.into());
            }
            tracing::debug!(subdir, "No compiler invocation in make output");
        }

        Err(CacheError::Malformed("failed to extract flags from make output".into()))
    }

    /// Runs make in dry-run mode for `targets`, as if `relative` had just changed.
    async fn dry_run(
        &self,
        subdir: Option<&str>,
        relative: &str,
        targets: &[&str],
    ) -> CacheEntry<String> {
        let changed = changed_path(subdir, relative);
        let invocation = Invocation::new(self.make_program.as_str())
            .args(["-C", subdir.unwrap_or(".")])
            .args(["-s", "-i", "-n", "-W", changed])
            .args(targets.iter().copied())
            .args([
                "V=1".to_owned(),
                format!("CC={FAKE_CC}"),
                format!("CXX={FAKE_CXX}"),
                format!("VALAC={FAKE_VALAC}"),
            ])
            .cwd(&self.makefile_dir);

        metric!(counter("makecache.flags.spawn") += 1);
        tracing::debug!(%invocation, "Extracting build flags");
        let output = self.pool.run(self.runner.run(invocation)).await??;
        if !output.success() {
            tracing::debug!(status = ?output.status, "make exited unsuccessfully");
        }
        Ok(output.stdout_lossy())
    }
}
