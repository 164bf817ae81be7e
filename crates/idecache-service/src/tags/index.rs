use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// The kind of a tag, as encoded by the single-letter kind field of a ctags line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TagKind {
    Anchor,
    ClassName,
    Define,
    Enumerator,
    Function,
    FileName,
    EnumerationName,
    Import,
    Member,
    Prototype,
    Structure,
    Typedef,
    Union,
    Variable,
    /// Any kind letter not listed above.
    Other,
}

impl TagKind {
    pub fn from_char(c: char) -> Self {
        match c {
            'a' => Self::Anchor,
            'c' => Self::ClassName,
            'd' => Self::Define,
            'e' => Self::Enumerator,
            'f' => Self::Function,
            'F' => Self::FileName,
            'g' => Self::EnumerationName,
            'i' => Self::Import,
            'm' => Self::Member,
            'p' => Self::Prototype,
            's' => Self::Structure,
            't' => Self::Typedef,
            'u' => Self::Union,
            'v' => Self::Variable,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anchor => "anchor",
            Self::ClassName => "class",
            Self::Define => "define",
            Self::Enumerator => "enumerator",
            Self::Function => "function",
            Self::FileName => "file",
            Self::EnumerationName => "enum",
            Self::Import => "import",
            Self::Member => "member",
            Self::Prototype => "prototype",
            Self::Structure => "struct",
            Self::Typedef => "typedef",
            Self::Union => "union",
            Self::Variable => "variable",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single symbol definition from a tags file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub name: String,
    /// Path of the defining file, usually relative to the index's path root.
    pub path: String,
    /// The search pattern or line number locating the definition, as written in the file.
    pub pattern: String,
    pub kind: TagKind,
    /// Line number, from a `line:` field or a numeric pattern.
    pub line: Option<u32>,
}

impl TagEntry {
    fn sort_key(&self) -> (&str, TagKind, &str, &str) {
        (&self.name, self.kind, &self.pattern, &self.path)
    }
}

/// An immutable, sorted in-memory index of one tags file.
///
/// Entries are ordered by name, then kind, pattern and path, so lookups by name or name prefix
/// are binary searches.
#[derive(Debug, Clone)]
pub struct TagIndex {
    file: PathBuf,
    path_root: PathBuf,
    mtime: Option<SystemTime>,
    entries: Vec<TagEntry>,
}

impl TagIndex {
    pub fn new(
        file: PathBuf,
        path_root: PathBuf,
        mtime: Option<SystemTime>,
        mut entries: Vec<TagEntry>,
    ) -> Self {
        entries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Self {
            file,
            path_root,
            mtime,
            entries,
        }
    }

    /// The tags file this index was built from.
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Directory that relative entry paths are resolved against.
    pub fn path_root(&self) -> &Path {
        &self.path_root
    }

    /// Modification time of the tags file when it was indexed.
    pub fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TagEntry] {
        &self.entries
    }

    /// All entries named exactly `name`.
    pub fn lookup(&self, name: &str) -> &[TagEntry] {
        let start = self.entries.partition_point(|e| e.name.as_str() < name);
        let len = self.entries[start..].partition_point(|e| e.name == name);
        &self.entries[start..start + len]
    }

    /// All entries whose name starts with `prefix`.
    pub fn lookup_prefix(&self, prefix: &str) -> &[TagEntry] {
        let start = self.entries.partition_point(|e| e.name.as_str() < prefix);
        let len = self.entries[start..].partition_point(|e| e.name.starts_with(prefix));
        &self.entries[start..start + len]
    }

    /// Resolves an entry path against the path root.
    pub fn resolve_path(&self, relative_path: &str) -> PathBuf {
        self.path_root.join(relative_path)
    }

    /// All entries defined in `relative_path`.
    ///
    /// This is a linear scan.
    pub fn find_with_path(&self, relative_path: &str) -> Vec<&TagEntry> {
        self.entries
            .iter()
            .filter(|e| e.path == relative_path)
            .collect()
    }

    /// Whether the tags file changed since this index was built.
    pub fn is_older_than(&self, file_mtime: Option<SystemTime>) -> bool {
        match (self.mtime, file_mtime) {
            (Some(indexed), Some(current)) => current > indexed,
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn entry(name: &str, kind: TagKind, path: &str) -> TagEntry {
        TagEntry {
            name: name.into(),
            path: path.into(),
            pattern: format!("/^{name}$/;\""),
            kind,
            line: None,
        }
    }

    fn index() -> TagIndex {
        TagIndex::new(
            "/project/tags".into(),
            "/project".into(),
            None,
            vec![
                entry("ide_object_new", TagKind::Function, "src/object.c"),
                entry("ide_buffer", TagKind::Structure, "src/buffer.h"),
                entry("ide_object", TagKind::Structure, "src/object.h"),
                entry("ide_object", TagKind::Typedef, "src/object.h"),
                entry("main", TagKind::Function, "src/main.c"),
                entry("ide_objects", TagKind::Variable, "src/object.c"),
            ],
        )
    }

    #[test]
    fn test_sorted() {
        let index = index();
        let names: Vec<_> = index.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "ide_buffer",
                "ide_object",
                "ide_object",
                "ide_object_new",
                "ide_objects",
                "main"
            ]
        );
        assert_eq!(index.entries()[1].kind, TagKind::Structure);
        assert_eq!(index.entries()[2].kind, TagKind::Typedef);
    }

    #[test]
    fn test_lookup() {
        let index = index();
        let found = index.lookup("ide_object");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|e| e.name == "ide_object"));

        assert!(index.lookup("ide_obj").is_empty());
        assert!(index.lookup("zzz").is_empty());
    }

    #[test]
    fn test_lookup_prefix() {
        let index = index();
        let names: Vec<_> = index
            .lookup_prefix("ide_obj")
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(
            names,
            ["ide_object", "ide_object", "ide_object_new", "ide_objects"]
        );
        assert_eq!(index.lookup_prefix("").len(), 6);
        assert!(index.lookup_prefix("nope").is_empty());
    }

    #[test]
    fn test_paths() {
        let index = index();
        assert_eq!(
            index.resolve_path("src/main.c"),
            PathBuf::from("/project/src/main.c")
        );
        assert_eq!(index.find_with_path("src/object.c").len(), 2);
        assert!(index.find_with_path("src/none.c").is_empty());
    }

    #[test]
    fn test_staleness() {
        let then = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let index = TagIndex::new("/t".into(), "/".into(), Some(then), vec![]);
        assert!(index.is_older_than(Some(then + Duration::from_secs(1))));
        assert!(!index.is_older_than(Some(then)));
        assert!(!index.is_older_than(None));
    }

    #[test]
    fn test_kind_letters() {
        assert_eq!(TagKind::from_char('f'), TagKind::Function);
        assert_eq!(TagKind::from_char('F'), TagKind::FileName);
        assert_eq!(TagKind::from_char('g'), TagKind::EnumerationName);
        assert_eq!(TagKind::from_char('Z'), TagKind::Other);
        assert_eq!(TagKind::Structure.to_string(), "struct");
    }
}
