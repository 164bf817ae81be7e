use std::path::Path;
use std::sync::Arc;

use idecache_service::service::Service;
use idecache_service::tags::{MiningState, TagIndexService, TagKind};

use crate::utils::{self, Collector, FakeRunner, next_index, setup, tempdir, write_tree};

const ROOT_TAGS: &str = "\
!_TAG_FILE_FORMAT\t2\t/extended format/
ide_context_new\tsrc/ide-context.c\t/^ide_context_new (void)$/;\"\tf\tline:42
ide_context_new\tsrc/ide-context.h\t/^IdeContext *ide_context_new (void);$/;\"\tp
IDE_IS_MAIN_THREAD\tsrc/ide-macros.h\t12;\"\td
";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mining_and_lookup() {
    setup();
    let workdir = tempdir();
    let cache = tempdir();
    write_tree(
        workdir.path(),
        &[
            ("tags", ROOT_TAGS),
            ("src/.tags", "IdeContext\tide-context.h\t/^struct _IdeContext$/;\"\ts\n"),
            (".git/tags", "hidden\thidden.c\t1;\"\tf\n"),
            ("empty/tags", ""),
        ],
    );

    let runner = Arc::new(FakeRunner::new());
    let service = TagIndexService::new(
        &utils::config(cache.path()),
        workdir.path().to_path_buf(),
        runner.clone(),
    );
    let (collector, mut received) = Collector::new();
    service.register_completion_provider(collector);

    service.start();
    assert_eq!(service.wait_until_steady().await, MiningState::Steady);

    let mut files: Vec<_> = service
        .indexes()
        .iter()
        .map(|index| index.file().to_path_buf())
        .collect();
    files.sort();
    assert_eq!(
        files,
        [workdir.path().join("src/.tags"), workdir.path().join("tags")]
    );
    next_index(&mut received).await;
    next_index(&mut received).await;
    assert!(received.try_recv().is_err());

    let root = service
        .get_or_build_index(&workdir.path().join("tags"))
        .await
        .unwrap();
    let definitions = root.lookup("ide_context_new");
    assert_eq!(definitions.len(), 2);
    assert_eq!(definitions[0].kind, TagKind::Function);
    assert_eq!(definitions[0].line, Some(42));
    assert_eq!(
        root.resolve_path(&definitions[0].path),
        workdir.path().join("src/ide-context.c")
    );
    assert_eq!(root.lookup_prefix("ide_").len(), 2);
    assert_eq!(root.lookup("IDE_IS_MAIN_THREAD")[0].line, Some(12));

    let nested = service
        .get_or_build_index(&workdir.path().join("src/.tags"))
        .await
        .unwrap();
    assert_eq!(nested.path_root(), workdir.path().join("src"));

    let err = service
        .get_or_build_index(&workdir.path().join("empty/tags"))
        .await
        .unwrap_err();
    assert!(err.is_negative());

    assert!(runner.calls_to("ctags").is_empty());
    service.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_saved_file_is_reindexed() {
    setup();
    let workdir = tempdir();
    let cache = tempdir();
    write_tree(
        workdir.path(),
        &[("src/widget.c", "void widget_new (void) {}\n")],
    );

    // ctags writes what it found into the file given with -f
    let runner = Arc::new(FakeRunner::new().with("ctags", |call| {
        let destination = Path::new(&call.args[1]);
        std::fs::write(
            destination,
            "widget_new\twidget.c\t/^void widget_new (void) {}$/;\"\tf\tline:1\n",
        )
        .unwrap();
        Vec::new()
    }));
    let service = TagIndexService::new(
        &utils::config(cache.path()),
        workdir.path().to_path_buf(),
        runner.clone(),
    );
    let (collector, mut received) = Collector::new();
    service.register_highlighter(collector);

    service.start();
    assert_eq!(service.wait_until_steady().await, MiningState::Steady);
    assert!(service.indexes().is_empty());

    service.file_saved(&workdir.path().join("src/widget.c"));
    service.file_saved(&workdir.path().join("src/widget.c"));
    let index = next_index(&mut received).await;

    assert_eq!(index.file(), service.tags_dir().join("src/tags"));
    assert_eq!(index.path_root(), workdir.path().join("src"));
    let definition = &index.lookup("widget_new")[0];
    assert_eq!(
        index.resolve_path(&definition.path),
        workdir.path().join("src/widget.c")
    );

    let calls = runner.calls_to("ctags");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].cwd.as_deref(), Some(&*workdir.path().join("src")));
    assert!(!calls[0].args.contains(&"--recurse".to_owned()));

    service.stop();
    assert_eq!(service.state(), MiningState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_observer_sees_loaded_indexes() {
    setup();
    let workdir = tempdir();
    let cache = tempdir();
    write_tree(workdir.path(), &[("tags", ROOT_TAGS)]);

    let service = TagIndexService::new(
        &utils::config(cache.path()),
        workdir.path().to_path_buf(),
        Arc::new(FakeRunner::new()),
    );
    service.start();
    service.wait_until_steady().await;

    let (collector, mut received) = Collector::new();
    service.register_highlighter(collector);
    let index = next_index(&mut received).await;
    assert_eq!(index.file(), workdir.path().join("tags"));
    assert_eq!(index.len(), 3);
}
