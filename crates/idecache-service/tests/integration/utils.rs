use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use idecache_service::config::{Config, TagsConfig};
use idecache_service::process::{Invocation, ProcessError, ProcessOutput, ProcessRunner};
use idecache_service::tags::{CompletionProvider, Highlighter, TagIndex};
use tokio::sync::mpsc;

pub use idecache_test::{setup, tempdir, write_tree};

/// A call seen by [`FakeRunner`].
#[derive(Debug, Clone)]
pub struct Call {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

type Handler = Arc<dyn Fn(&Call) -> Vec<u8> + Send + Sync>;

/// Stands in for `make`, `clang` and `ctags`.
///
/// Unknown programs fail to spawn, like on a machine without them.
#[derive(Default)]
pub struct FakeRunner {
    handlers: HashMap<String, Handler>,
    calls: Mutex<Vec<Call>>,
}

impl std::fmt::Debug for FakeRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeRunner").finish_non_exhaustive()
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, program: &str, handler: F) -> Self
    where
        F: Fn(&Call) -> Vec<u8> + Send + Sync + 'static,
    {
        self.handlers.insert(program.to_owned(), Arc::new(handler));
        self
    }

    pub fn calls_to(&self, program: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.program == program)
            .cloned()
            .collect()
    }
}

impl ProcessRunner for FakeRunner {
    fn run(
        &self,
        mut invocation: Invocation,
    ) -> BoxFuture<'static, Result<ProcessOutput, ProcessError>> {
        let call = Call {
            program: invocation.program().to_owned(),
            args: invocation.arguments().to_vec(),
            cwd: invocation.working_dir().map(Path::to_path_buf),
        };
        self.calls.lock().unwrap().push(call.clone());
        let handler = self.handlers.get(&call.program).cloned();
        let file = invocation.take_stdout_file();

        Box::pin(async move {
            let Some(handler) = handler else {
                return Err(ProcessError::Spawn {
                    program: call.program,
                    source: std::io::ErrorKind::NotFound.into(),
                });
            };
            let stdout = handler(&call);
            match file {
                Some(mut file) => {
                    file.write_all(&stdout).unwrap();
                    Ok(ProcessOutput {
                        stdout: Vec::new(),
                        status: Some(0),
                    })
                }
                None => Ok(ProcessOutput {
                    stdout,
                    status: Some(0),
                }),
            }
        })
    }
}

/// A config writing below `cache_dir`, with mining limited to the project.
pub fn config(cache_dir: &Path) -> Config {
    Config {
        cache_dir: Some(cache_dir.to_path_buf()),
        workers: 2,
        tags: TagsConfig {
            mine_home: false,
            system_include_dirs: vec![],
            mine_delay: Duration::ZERO,
            rebuild_delay: Duration::from_millis(20),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Forwards every index it receives into a channel.
#[derive(Debug)]
pub struct Collector(mpsc::UnboundedSender<Arc<TagIndex>>);

impl Collector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<TagIndex>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self(sender)), receiver)
    }
}

impl Highlighter for Collector {
    fn add_index(&self, index: Arc<TagIndex>) {
        let _ = self.0.send(index);
    }
}

impl CompletionProvider for Collector {
    fn add_index(&self, index: Arc<TagIndex>) {
        let _ = self.0.send(index);
    }
}

/// Receives the next index, failing the test after a few seconds.
pub async fn next_index(receiver: &mut mpsc::UnboundedReceiver<Arc<TagIndex>>) -> Arc<TagIndex> {
    tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timed out waiting for an index")
        .expect("service dropped")
}
