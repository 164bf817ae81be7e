use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::caching::{CacheEntry, CacheError};

use super::index::{TagEntry, TagKind};

/// Parses the contents of a ctags file.
///
/// Header lines starting with `!` and lines with fewer than four fields are skipped. The result
/// is in file order.
pub fn parse_tags(contents: &str) -> Vec<TagEntry> {
    contents.lines().filter_map(parse_line).collect()
}

/// Parses `name\tpath\tpattern\tkind[\tkey:value...]`.
fn parse_line(line: &str) -> Option<TagEntry> {
    let line = line.trim_end_matches('\r');
    if line.is_empty() || line.starts_with('!') {
        return None;
    }

    // runs of tabs separate a single field
    let mut fields = line.split('\t').filter(|field| !field.is_empty());
    let name = fields.next()?;
    let path = fields.next()?;
    let pattern = fields.next()?;
    let kind = fields.next()?.chars().next().map(TagKind::from_char)?;

    let line = fields
        .find_map(|field| field.strip_prefix("line:"))
        .and_then(|n| n.parse().ok())
        .or_else(|| pattern.trim_end_matches(";\"").parse().ok());

    Some(TagEntry {
        name: name.to_owned(),
        path: path.to_owned(),
        pattern: pattern.to_owned(),
        kind,
        line,
    })
}

/// Memory-maps and parses the tags file at `path`.
///
/// A file without any entries is reported as [`CacheError::NotFound`], a file that is not UTF-8
/// as [`CacheError::Malformed`].
pub fn load_tags_file(path: &Path) -> CacheEntry<Vec<TagEntry>> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(CacheError::not_found("tags file is empty"));
    }

    // SAFETY: the map is read-only and dropped before this function returns. A concurrent
    // writer truncating the file is the caveat every mmap reader accepts.
    let mmap = unsafe { Mmap::map(&file)? };
    let contents = std::str::from_utf8(&mmap).map_err(|e| {
        CacheError::Malformed(format!("{} is not valid UTF-8: {e}", path.display()))
    })?;

    let entries = parse_tags(contents);
    if entries.is_empty() {
        return Err(CacheError::not_found("tags file is empty"));
    }
    Ok(entries)
}
