//! The caching, admission-control and path-resolution core of the drivegate.
//!
//! A request host and path are turned into a [`Resolution`](resolver::Resolution) by the
//! [`UriResolver`](resolver::UriResolver), which consults a remote [`Origin`](origin::Origin)
//! through request-coalescing caches. Functions are executed behind an
//! [`ExecSlotQueue`](exec::ExecSlotQueue) with their prepared handlers held in a
//! stale-while-revalidate cache.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod conditional;
pub mod config;
pub mod exec;
pub mod functions;
pub mod logging;
pub mod origin;
pub mod resolver;
pub mod routes;
pub mod sites;
pub mod utils;
