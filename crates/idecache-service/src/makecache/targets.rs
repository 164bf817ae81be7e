use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use regex::Regex;

use crate::caching::{CacheEntry, CacheError};

/// A make target that builds a source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MakeTarget {
    /// The automake `subdir` the target was found in, relative to the Makefile.
    pub subdir: Option<String>,
    pub target: String,
}

impl MakeTarget {
    pub fn new(subdir: Option<&str>, target: impl Into<String>) -> Self {
        Self {
            subdir: subdir.map(Into::into),
            target: target.into(),
        }
    }
}

impl fmt::Display for MakeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subdir {
            Some(subdir) => write!(f, "{} (in {subdir})", self.target),
            None => f.write_str(&self.target),
        }
    }
}

/// Finds the targets referencing a file in a make database.
pub trait TargetScanner: Send + Sync + fmt::Debug {
    /// Returns the targets for `relative_path` in order of appearance, without duplicates.
    ///
    /// An empty result means no target references the file.
    fn scan(&self, database: &str, relative_path: &str) -> CacheEntry<Vec<MakeTarget>>;
}

/// Scans the database line by line for rules mentioning the file's name.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexTargetScanner;

impl TargetScanner for RegexTargetScanner {
    fn scan(&self, database: &str, relative_path: &str) -> CacheEntry<Vec<MakeTarget>> {
        find_targets(database, relative_path)
    }
}

fn is_target_interesting(target: &str) -> bool {
    !target.starts_with('#')
        && !target.starts_with('.')
        && (target.ends_with(".o") || target.ends_with(".lo"))
}

/// Finds the object targets whose rule mentions the base name of `relative_path`.
///
/// Vala sources are looked up through the C file valac generates for them, and their targets
/// are renamed to the `_vala.stamp` target automake generates.
pub fn find_targets(database: &str, relative_path: &str) -> CacheEntry<Vec<MakeTarget>> {
    let translated = relative_path
        .strip_suffix(".vala")
        .map(|stem| format!("{stem}.c"));
    let path = translated.as_deref().unwrap_or(relative_path);
    let base = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned());

    let pattern = format!(r"^([^:\n ]+):.*\b({})\b", regex::escape(&base));
    let regex = Regex::new(&pattern)
        .map_err(|e| CacheError::Malformed(format!("invalid target pattern: {e}")))?;

    let mut subdir: Option<&str> = None;
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for line in database.lines() {
        if let Some(dir) = line.strip_prefix("subdir = ") {
            if !dir.is_empty() {
                subdir = Some(dir);
            }
            continue;
        }

        let Some(captures) = regex.captures(line) else {
            continue;
        };
        let target = &captures[1];
        if !is_target_interesting(target) {
            continue;
        }

        let target = MakeTarget::new(subdir, target);
        if seen.insert(target.clone()) {
            targets.push(target);
        }
    }

    if translated.is_some() {
        for target in &mut targets {
            if let Some(stamp) = vala_stamp(&target.target, &base) {
                target.target = stamp;
            }
        }
    }

    Ok(targets)
}

/// Maps an object target of a Vala source to automake's stamp target.
///
/// `libfoo_la-foo.lo` becomes `libfoo_la_vala.stamp`. A plain `foo.lo` for `foo.vala` is kept,
/// since flags can still be extracted from it.
fn vala_stamp(target: &str, base: &str) -> Option<String> {
    // non-recursive automake puts the target into the current subdir
    let name = target.rsplit_once('/').map_or(target, |(_, name)| name);

    if let Some(stem) = name.strip_suffix(".lo") {
        if base.starts_with(stem) {
            return None;
        }
    }

    let (prefix, _) = name.split_once('-')?;
    Some(format!("{prefix}_vala.stamp"))
}
