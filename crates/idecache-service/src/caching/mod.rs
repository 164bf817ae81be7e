//! Core caching logic.
//!
//! Values in idecache are expensive to produce: they come from parsing tags files, scanning a
//! make database or running `make` itself. The [`Cacher`] memoizes such values per key:
//!
//! - Concurrent requests for the same key share a single computation ([`SingleFlight`]).
//! - Successful values are kept in memory, optionally with a time to live.
//! - [`CacheError::NotFound`] results are kept as negative entries, so a miss is not recomputed
//!   on every lookup.
//! - Any other error is never stored. The next lookup simply retries.
//!
//! Computations run in their own tokio task. Dropping a lookup future detaches only that
//! caller. Anything that has to be bounded, like subprocesses, should go through a
//! [`WorkerPool`](crate::utils::pool::WorkerPool) inside the computation.

mod cache_error;
mod cleanup;
mod config;
mod memory;
mod single_flight;

pub use cache_error::{CacheEntry, CacheError, ErrorKind};
pub use cleanup::cleanup;
pub use config::CacheName;
pub use memory::Cacher;
pub use single_flight::{Abandoned, Joined, SingleFlight};
