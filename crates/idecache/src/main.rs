//! idecache.
//!
//! Command line access to the caches an IDE keeps about a project: the symbol indices of its
//! ctags files and the compiler flags of its Makefile-built sources.

#![warn(
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;
mod output;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
