//! Build flag resolution for Makefile projects.
//!
//! Flags are resolved in two memoized stages. The first finds the make targets referencing a
//! source file in a dump of the make database (the makecache). The second asks make for a dry
//! run of those targets with the compilers replaced by sentinels and parses the compiler line.

mod flags;
mod resolver;
mod snapshot;
mod targets;

pub use flags::{
    FAKE_CC, FAKE_CXX, FAKE_VALAC, extract_flags, parse_compiler_args, parse_line,
    parse_valac_args,
};
pub use resolver::BuildFlagsResolver;
pub use snapshot::{MakeSnapshot, SnapshotRequest, TEMP_MARKER, build_snapshot};
pub use targets::{MakeTarget, RegexTargetScanner, TargetScanner, find_targets};
