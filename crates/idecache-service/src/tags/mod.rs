//! Tag index service: discovers ctags files and serves their parsed indices.

mod builder;
mod index;
mod parse;
mod service;

pub use builder::{CtagsBuilder, MakeTagsBuilder, TagsBuilder};
pub use index::{TagEntry, TagIndex, TagKind};
pub use parse::{load_tags_file, parse_tags};
pub use service::{CompletionProvider, Highlighter, MiningState, TagIndexService};
