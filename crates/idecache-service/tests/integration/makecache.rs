use std::path::Path;
use std::sync::Arc;

use idecache_service::caching::{self, CacheError};
use idecache_service::makecache::{BuildFlagsResolver, MakeTarget};

use crate::utils::{self, Call, FakeRunner, setup, tempdir, write_tree};

const DATABASE: &str = "\
# GNU Make 4.4.1
# Make data base, printed on Mon Mar  3 10:00:00 2025

subdir = src
libide_la-ide-context.lo: ide-context.c ide-context.h ide-macros.h
libide_la-ide-object.lo: ide-object.c ide-object.h ide-macros.h
# Not a target:
ide-context.c:
";

/// Answers `make -p` with [`DATABASE`] and dry runs like a libtool build in `src`.
fn make(call: &Call) -> Vec<u8> {
    if call.args[0] == "-p" {
        return DATABASE.into();
    }
    let changed = &call.args[6];
    format!(
        "/bin/bash ../libtool --tag=CC --mode=compile __LIBIDE_FAKE_CC__ -DHAVE_CONFIG_H -I. \\\n\
         \t-I.. -Wall -DFILE=\\\"{changed}\\\" -c -o x.lo `test -f '{changed}' || echo './'`{changed}\n"
    )
    .into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resolve_flags_and_targets() {
    setup();
    let project = tempdir();
    let cache = tempdir();
    write_tree(project.path(), &[("Makefile", "SUBDIRS = src\n")]);

    let runner = Arc::new(
        FakeRunner::new()
            .with("make", make)
            .with("clang", |_| b"/usr/lib64/clang/18/include\n".to_vec()),
    );
    let resolver = BuildFlagsResolver::new(
        &utils::config(cache.path()),
        project.path().join("Makefile"),
        runner.clone(),
    );

    let targets = resolver
        .get_targets(Path::new("src/ide-macros.h"))
        .await
        .unwrap();
    assert_eq!(
        &*targets,
        [
            MakeTarget::new(Some("src"), "libide_la-ide-context.lo"),
            MakeTarget::new(Some("src"), "libide_la-ide-object.lo"),
        ]
    );

    let flags = resolver
        .get_flags(&project.path().join("src/ide-context.c"))
        .await
        .unwrap();
    let src = project.path().join("src");
    assert_eq!(
        &*flags,
        [
            "-I/usr/lib64/clang/18/include".to_owned(),
            "-DHAVE_CONFIG_H".to_owned(),
            format!("-I{}", src.join(".").display()),
            format!("-I{}", src.join("..").display()),
            "-Wall".to_owned(),
            "-DFILE=\"ide-context.c\"".to_owned(),
        ]
    );

    let dry_runs: Vec<_> = runner
        .calls_to("make")
        .into_iter()
        .filter(|call| call.args[0] == "-C")
        .collect();
    assert_eq!(dry_runs.len(), 1);
    assert_eq!(dry_runs[0].args[1], "src");
    assert_eq!(dry_runs[0].args[7], "libide_la-ide-context.lo");
    assert_eq!(dry_runs[0].cwd.as_deref(), Some(project.path()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_makecache_file() {
    setup();
    let project = tempdir();
    let cache = tempdir();
    write_tree(project.path(), &[("Makefile", "SUBDIRS = src\n")]);
    let config = utils::config(cache.path());

    let runner = Arc::new(FakeRunner::new().with("make", make));
    let resolver = BuildFlagsResolver::new(&config, project.path().join("Makefile"), runner);
    resolver.wait_ready().await.unwrap();
    assert!(resolver.is_ready());

    let files: Vec<_> = std::fs::read_dir(cache.path().join("makecache"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with(".makecache"));
    assert_eq!(
        std::fs::read_to_string(cache.path().join("makecache").join(&files[0])).unwrap(),
        DATABASE
    );

    // nothing stale to clean up
    assert_eq!(caching::cleanup(&config, false).unwrap(), 0);
    assert!(cache.path().join("makecache").join(&files[0]).is_file());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_without_make_and_clang() {
    setup();
    let project = tempdir();
    let cache = tempdir();
    write_tree(project.path(), &[("Makefile", "all:\n")]);

    let resolver = BuildFlagsResolver::new(
        &utils::config(cache.path()),
        project.path().join("Makefile"),
        Arc::new(FakeRunner::new()),
    );

    let err = resolver.get_flags(Path::new("main.c")).await.unwrap_err();
    assert!(matches!(err, CacheError::ProcessFailed(_)), "{err:?}");
    assert!(!resolver.is_ready());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_files() {
    setup();
    let project = tempdir();
    let cache = tempdir();
    write_tree(project.path(), &[("Makefile", "SUBDIRS = src\n")]);

    let runner = Arc::new(FakeRunner::new().with("make", make));
    let resolver = BuildFlagsResolver::new(
        &utils::config(cache.path()),
        project.path().join("Makefile"),
        runner.clone(),
    );

    let files = ["src/ide-context.c", "src/ide-object.c", "src/ide-context.c", "README"];
    let lookups = files.iter().map(|file| {
        let resolver = resolver.clone();
        async move { resolver.get_flags(Path::new(file)).await }
    });
    let results = futures::future::join_all(lookups).await;

    assert!(results[0].as_ref().unwrap().contains(&"-DFILE=\"ide-context.c\"".to_owned()));
    assert!(results[1].as_ref().unwrap().contains(&"-DFILE=\"ide-object.c\"".to_owned()));
    assert_eq!(results[0], results[2]);
    assert!(results[3].as_ref().unwrap_err().is_negative());

    // one database, one dry run per distinct source file
    assert_eq!(runner.calls_to("make").len(), 3);
}
