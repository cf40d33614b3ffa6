//! Core of a caching DNS resolver: an arena cache with oldest-first
//! eviction, a non-blocking upstream query engine, and a reader for
//! constant hash databases.

pub mod cache;
pub mod cdb;
pub mod cdb_make;
pub mod clock;
pub mod config;
pub mod merge;
pub mod proto_utils;
pub mod random;
pub mod resolve;
pub mod transmit;
pub mod watcher;

#[cfg(test)]
mod testutil;
