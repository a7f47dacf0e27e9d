//! Drivegate.
//!
//! Drivegate is a multi-tenant web server that serves sites straight out of a cloud drive. Every
//! host is a folder on the drive: its files are served as static content or directory listings,
//! and scripts matching a site's function pattern are executed per request in a child process.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

mod cli;
mod endpoints;
mod logging;
mod server;
mod service;

#[cfg(test)]
mod test;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
