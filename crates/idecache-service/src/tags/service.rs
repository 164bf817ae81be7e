use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use walkdir::WalkDir;

use crate::caching::{CacheEntry, CacheError, CacheName, Cacher};
use crate::config::{Config, TagsBuilderKind, TagsConfig};
use crate::process::ProcessRunner;
use crate::service::Service;
use crate::utils::fs::mtime;
use crate::utils::pool::WorkerPool;
use crate::utils::project::project_id;

use super::builder::{CtagsBuilder, MakeTagsBuilder, TagsBuilder};
use super::index::TagIndex;
use super::parse::load_tags_file;

/// Receives every tag index the service loads.
pub trait Highlighter: Send + Sync {
    fn add_index(&self, index: Arc<TagIndex>);
}

/// Receives every tag index the service loads.
pub trait CompletionProvider: Send + Sync {
    fn add_index(&self, index: Arc<TagIndex>);
}

/// Where the service is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningState {
    /// Not started yet.
    Uninitialized,
    /// A mining walk is queued or running.
    Mining,
    /// The last mining walk and the loads it triggered have finished.
    Steady,
    /// Stopped. No further mining happens.
    Stopped,
}

#[derive(Default)]
struct Observers {
    highlighters: Vec<Arc<dyn Highlighter>>,
    completions: Vec<Arc<dyn CompletionProvider>>,
}

struct Inner {
    config: TagsConfig,
    workdir: PathBuf,
    tags_dir: PathBuf,
    home_dir: Option<PathBuf>,
    indexes: Cacher<PathBuf, Arc<TagIndex>>,
    pool: WorkerPool,
    builder: Arc<dyn TagsBuilder>,
    observers: Mutex<Observers>,
    state: watch::Sender<MiningState>,
    cancel: CancellationToken,
    /// Set while a mining walk is queued or running.
    mine_queued: AtomicBool,
    /// Directories with a queued rebuild.
    pending_builds: Mutex<HashSet<PathBuf>>,
}

/// Discovers ctags files for a project and serves their parsed indices.
///
/// Mining walks the project's tags cache directory and the working directory recursively, the
/// home directory non-recursively and the configured system include directories recursively,
/// looking for regular files named `tags` or `.tags`. Every file found is loaded into the index
/// cache and handed to all registered [`Highlighter`]s and [`CompletionProvider`]s.
///
/// All background work runs on the tokio runtime, so the service must be started from within
/// one. Indices already handed to the cache keep loading after [`stop`](Service::stop); they are
/// just never observed.
#[derive(Clone)]
pub struct TagIndexService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TagIndexService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagIndexService")
            .field("workdir", &self.inner.workdir)
            .field("state", &*self.inner.state.borrow())
            .field("indexes", &self.inner.indexes)
            .finish()
    }
}

impl TagIndexService {
    /// Creates the service for the project at `workdir`, rebuilding tags with the configured
    /// builder.
    pub fn new(config: &Config, workdir: PathBuf, runner: Arc<dyn ProcessRunner>) -> Self {
        let tags_dir = tags_dir(config, &workdir);
        let builder: Arc<dyn TagsBuilder> = match config.tags.builder {
            TagsBuilderKind::Ctags => Arc::new(CtagsBuilder::new(
                runner,
                config.tags.ctags_program.as_str(),
                workdir.clone(),
                tags_dir,
            )),
            TagsBuilderKind::Make => Arc::new(MakeTagsBuilder::new(
                runner,
                config.make.make_program.as_str(),
            )),
        };
        Self::with_builder(config, workdir, builder)
    }

    pub fn with_builder(config: &Config, workdir: PathBuf, builder: Arc<dyn TagsBuilder>) -> Self {
        let (state, _) = watch::channel(MiningState::Uninitialized);
        let inner = Inner {
            config: config.tags.clone(),
            tags_dir: tags_dir(config, &workdir),
            workdir,
            home_dir: dirs::home_dir(),
            indexes: Cacher::new(CacheName::TagIndexes, config.caches.tag_indexes),
            pool: WorkerPool::new(config.workers),
            builder,
            observers: Mutex::new(Observers::default()),
            state,
            cancel: CancellationToken::new(),
            mine_queued: AtomicBool::new(false),
            pending_builds: Mutex::new(HashSet::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.inner.workdir
    }

    /// The per-project directory the ctags builder writes to.
    pub fn tags_dir(&self) -> &Path {
        &self.inner.tags_dir
    }

    pub fn state(&self) -> MiningState {
        *self.inner.state.borrow()
    }

    /// Waits until no mining walk is pending, or the service was stopped.
    pub async fn wait_until_steady(&self) -> MiningState {
        let mut receiver = self.inner.state.subscribe();
        match receiver
            .wait_for(|state| matches!(state, MiningState::Steady | MiningState::Stopped))
            .await
        {
            Ok(state) => *state,
            // the sender lives as long as `self`
            Err(_) => MiningState::Stopped,
        }
    }

    /// Returns the index for the tags file at `path`, parsing it if necessary.
    pub async fn get_or_build_index(&self, path: &Path) -> CacheEntry<Arc<TagIndex>> {
        self.inner.get_or_build_index(path.to_path_buf()).await
    }

    /// All indices loaded so far, in no particular order.
    pub fn indexes(&self) -> Vec<Arc<TagIndex>> {
        self.inner.indexes.values()
    }

    /// Adds `highlighter`, replaying every index that is already loaded.
    pub fn register_highlighter(&self, highlighter: Arc<dyn Highlighter>) {
        let replay = {
            let mut observers = self.inner.observers();
            observers.highlighters.push(Arc::clone(&highlighter));
            self.indexes()
        };
        for index in replay {
            highlighter.add_index(index);
        }
    }

    pub fn unregister_highlighter(&self, highlighter: &Arc<dyn Highlighter>) {
        self.inner
            .observers()
            .highlighters
            .retain(|h| !std::ptr::addr_eq(Arc::as_ptr(h), Arc::as_ptr(highlighter)));
    }

    /// Adds `provider`, replaying every index that is already loaded.
    pub fn register_completion_provider(&self, provider: Arc<dyn CompletionProvider>) {
        let replay = {
            let mut observers = self.inner.observers();
            observers.completions.push(Arc::clone(&provider));
            self.indexes()
        };
        for index in replay {
            provider.add_index(index);
        }
    }

    pub fn unregister_completion_provider(&self, provider: &Arc<dyn CompletionProvider>) {
        self.inner
            .observers()
            .completions
            .retain(|p| !std::ptr::addr_eq(Arc::as_ptr(p), Arc::as_ptr(provider)));
    }

    /// Queues a mining walk, unless one is already queued or running.
    pub fn queue_mine(&self) {
        Arc::clone(&self.inner).queue_mine();
    }

    /// Queues a tags rebuild for the directory of a saved file.
    ///
    /// Files outside of the working directory are ignored. Rebuilds are debounced per
    /// directory.
    pub fn file_saved(&self, path: &Path) {
        if !path.starts_with(&self.inner.workdir) {
            return;
        }
        if let Some(directory) = path.parent() {
            Arc::clone(&self.inner).queue_build(directory.to_path_buf(), false);
        }
    }
}

impl Service for TagIndexService {
    fn name(&self) -> &'static str {
        "tags"
    }

    fn start(&self) {
        if self.state() == MiningState::Uninitialized {
            self.queue_mine();
        }
    }

    fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.state.send_replace(MiningState::Stopped);
    }

    fn loaded(&self) {
        let workdir = self.inner.workdir.clone();
        Arc::clone(&self.inner).queue_build(workdir, true);
    }
}

fn tags_dir(config: &Config, workdir: &Path) -> PathBuf {
    config.cache_path("tags").join(project_id(workdir))
}

impl Inner {
    fn observers(&self) -> std::sync::MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn set_state(&self, state: MiningState) {
        self.state.send_if_modified(|current| {
            if *current == MiningState::Stopped || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Entry paths of a tags file in the cache directory are relative to the working directory.
    /// All other tags files are relative to the directory they are in.
    fn resolve_path_root(&self, file: &Path) -> PathBuf {
        let parent = file.parent().unwrap_or(Path::new("/"));
        match parent.strip_prefix(&self.tags_dir) {
            Ok(relative) => self.workdir.join(relative),
            Err(_) => parent.to_path_buf(),
        }
    }

    async fn get_or_build_index(self: &Arc<Self>, path: PathBuf) -> CacheEntry<Arc<TagIndex>> {
        let this = Arc::clone(self);
        self.indexes
            .compute_memoized(path, move |path| async move { this.build_index(path).await })
            .await
    }

    async fn build_index(&self, path: PathBuf) -> CacheEntry<Arc<TagIndex>> {
        let path_root = self.resolve_path_root(&path);
        self.pool
            .spawn_blocking(move || {
                let mtime = mtime(&path);
                let entries = load_tags_file(&path)?;
                metric!(time_raw("tags.index.entries") = entries.len() as u64);
                tracing::debug!(
                    path = %path.display(),
                    entries = entries.len(),
                    "Indexed tags file"
                );
                Ok(Arc::new(TagIndex::new(path, path_root, mtime, entries)))
            })
            .await?
    }

    /// Loads the tags file at `path` and hands the index to all observers.
    ///
    /// An index that is already loaded is only rebuilt if the file changed since. So is a file
    /// that was empty when it was last looked at. A loaded index is never dropped in favor of
    /// an empty file.
    async fn load(self: Arc<Self>, path: PathBuf) {
        let changed = match self.indexes.peek_dated(&path) {
            Some((Ok(previous), _)) => {
                if !previous.is_older_than(mtime(&path)) {
                    return;
                }
                true
            }
            Some((Err(CacheError::NotFound(_)), installed)) => {
                mtime(&path).is_some_and(|mtime| mtime > installed)
            }
            _ => false,
        };

        let result = if changed {
            let this = Arc::clone(&self);
            self.indexes
                .refresh(path.clone(), move |path| async move {
                    this.build_index(path).await
                })
                .await
        } else {
            self.get_or_build_index(path.clone()).await
        };

        match result {
            Ok(index) => self.notify(index),
            Err(CacheError::NotFound(reason)) => {
                tracing::trace!(path = %path.display(), %reason, "Skipping tags file");
            }
            Err(error) => {
                tracing::debug!(path = %path.display(), %error, "Failed to load tags file");
            }
        }
    }

    fn notify(&self, index: Arc<TagIndex>) {
        if self.is_stopped() {
            return;
        }
        let (highlighters, completions) = {
            let observers = self.observers();
            (observers.highlighters.clone(), observers.completions.clone())
        };
        for highlighter in highlighters {
            highlighter.add_index(Arc::clone(&index));
        }
        for provider in completions {
            provider.add_index(Arc::clone(&index));
        }
    }

    fn mine_roots(&self) -> Vec<(PathBuf, bool)> {
        let mut roots = vec![(self.tags_dir.clone(), true)];
        if self.config.mine_home {
            if let Some(home) = &self.home_dir {
                roots.push((home.clone(), false));
            }
        }
        roots.push((self.workdir.clone(), true));
        for dir in &self.config.system_include_dirs {
            roots.push((dir.clone(), true));
        }
        roots
    }

    fn queue_mine(self: Arc<Self>) {
        if self.is_stopped() || self.mine_queued.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(MiningState::Mining);

        let span = tracing::debug_span!("mine", workdir = %self.workdir.display());
        tokio::spawn(
            async move {
                let delay = self.config.mine_delay;
                if !self.sleep_unless_stopped(delay).await {
                    return;
                }

                let roots = self.mine_roots();
                let cancel = self.cancel.clone();
                let found = self
                    .pool
                    .spawn_blocking(move || find_tags_files(&roots, &cancel))
                    .await;
                self.mine_queued.store(false, Ordering::SeqCst);

                let found = match found {
                    Ok(found) => found,
                    Err(error) => {
                        tracing::error!(%error, "Mining tags files failed");
                        self.set_state(MiningState::Steady);
                        return;
                    }
                };
                metric!(counter("tags.mined") += found.len() as i64);
                tracing::debug!(count = found.len(), "Mined tags files");

                let loads = found
                    .into_iter()
                    .map(|path| Arc::clone(&self).load(path));
                futures::future::join_all(loads).await;

                if !self.mine_queued.load(Ordering::SeqCst) {
                    self.set_state(MiningState::Steady);
                }
            }
            .instrument(span),
        );
    }

    fn queue_build(self: Arc<Self>, directory: PathBuf, recursive: bool) {
        if self.is_stopped() {
            return;
        }
        {
            let mut pending = self
                .pending_builds
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !pending.insert(directory.clone()) {
                return;
            }
        }

        let span = tracing::debug_span!("rebuild_tags", directory = %directory.display());
        tokio::spawn(
            async move {
                let delay = self.config.rebuild_delay;
                let proceed = self.sleep_unless_stopped(delay).await;
                self.pending_builds
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&directory);
                if !proceed {
                    return;
                }

                let build = self
                    .builder
                    .build(&directory, recursive, self.cancel.clone());
                if let Err(error) = build.await {
                    tracing::warn!(%error, "Failed to build tags");
                }
                self.queue_mine();
            }
            .instrument(span),
        );
    }

    /// Returns `false` if the service was stopped before `delay` elapsed.
    async fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Walks `roots` looking for regular files named `tags` or `.tags`.
///
/// Recursive roots are walked without following symlinked directories. Version control
/// directories are skipped.
fn find_tags_files(roots: &[(PathBuf, bool)], cancel: &CancellationToken) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for (root, recursive) in roots {
        let mut walk = WalkDir::new(root).follow_links(false);
        if !recursive {
            walk = walk.max_depth(1);
        }
        let entries = walk
            .into_iter()
            .filter_entry(|entry| !(entry.file_type().is_dir() && entry.file_name() == ".git"))
            .filter_map(Result::ok);

        for entry in entries {
            if cancel.is_cancelled() {
                return found;
            }
            let name = entry.file_name();
            if name != "tags" && name != ".tags" {
                continue;
            }
            // symlinked tags files are fine, symlinked directories are not descended into
            if entry.path().is_file() && seen.insert(entry.path().to_path_buf()) {
                found.push(entry.into_path());
            }
        }
    }

    found
}
