//! Asynchronous, key-addressed caches over externally computed IDE metadata.
//!
//! The core is [`caching::Cacher`], a memoizing cache that coalesces concurrent population of
//! the same key into a single computation. Two consumers are built on top of it:
//!
//! - [`tags::TagIndexService`] discovers ctags files on disk and serves parsed indices to
//!   registered highlighters and completion providers.
//! - [`makecache::BuildFlagsResolver`] resolves per-file compiler flags and make targets from a
//!   memory-mapped `make -p -n -s` database.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod makecache;
pub mod process;
pub mod service;
pub mod tags;
pub mod utils;
