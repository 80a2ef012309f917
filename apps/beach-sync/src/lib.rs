//! Client side of a live app session: finds a reachable host, keeps a
//! persistent stream open to it, de-duplicates repeated payloads through a
//! content-addressed cache and reconciles incremental updates into an
//! immutable render tree.

pub mod cache;
pub mod channel;
pub mod config;
pub mod probe;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod tree;
