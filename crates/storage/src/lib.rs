//! Storage layer for gridtx
//!
//! This crate implements an in-memory region backend with:
//! - InMemoryRegion: bucketed DashMap + FxHashMap storage
//! - Per-bucket hosting members, with simulated member departure
//! - Version management with AtomicU64
//! - Entry pins held by transactions between lock reservation and cleanup

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod region;

pub use region::InMemoryRegion;
