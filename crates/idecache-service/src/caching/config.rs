use std::fmt;

/// All known cache names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheName {
    TagIndexes,
    MakeTargets,
    MakeFlags,
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        match self {
            Self::TagIndexes => "tag_indexes",
            Self::MakeTargets => "make_targets",
            Self::MakeFlags => "make_flags",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}
