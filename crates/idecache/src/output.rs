use std::path::PathBuf;
use std::sync::Arc;

use idecache_service::caching::CacheEntry;
use idecache_service::makecache::MakeTarget;
use idecache_service::tags::TagIndex;
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Table, row};

pub fn print_indexes(indexes: &[Arc<TagIndex>]) {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Tags File", "Path Root", "Entries"]);
    for index in indexes {
        table.add_row(row![
            index.file().display(),
            index.path_root().display(),
            r->index.len()
        ]);
    }
    table.printstd();
}

pub fn print_lookup(name: &str, indexes: &[Arc<TagIndex>]) {
    println!();
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => name, "Kind", "File", "Line"]);

    let mut found = false;
    for index in indexes {
        for entry in index.lookup(name) {
            found = true;
            let line = entry.line.map(|line| line.to_string()).unwrap_or_default();
            table.add_row(row![
                "",
                entry.kind,
                index.resolve_path(&entry.path).display(),
                r->line
            ]);
        }
    }
    if !found {
        table.add_row(row!["", "not found"]);
    }
    table.printstd();
}

pub fn print_flags(results: &[(PathBuf, CacheEntry<Arc<[String]>>)]) {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "File", "Flags"]);
    for (file, flags) in results {
        let flags = match flags {
            Ok(flags) if flags.is_empty() => "(none)".to_owned(),
            Ok(flags) => flags.join(" "),
            Err(err) => err.to_string(),
        };
        table.add_row(row![file.display(), flags]);
    }
    table.printstd();
}

pub fn print_targets(results: &[(PathBuf, CacheEntry<Arc<[MakeTarget]>>)]) {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "File", "Targets"]);
    for (file, targets) in results {
        let targets = match targets {
            Ok(targets) => targets
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            Err(err) => err.to_string(),
        };
        table.add_row(row![file.display(), targets]);
    }
    table.printstd();
}

pub fn print_cleanup(count: usize, dry_run: bool) {
    if dry_run {
        println!("{count} stale makecache files would be removed");
    } else {
        println!("{count} stale makecache files removed");
    }
}
