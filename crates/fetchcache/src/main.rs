//! fetchcache.
//!
//! A deduplicating, concurrency-bounded download cache with a small command
//! line frontend: `fetch` downloads URLs through the cache, `cleanup`
//! expunges stale cache entries.

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(1);
        }
    }
}
