//! # Storage Module
//!
//! Durable storage for acquired samples.
//!
//! This module handles:
//! - Pool abstraction over flash partitions and removable media
//! - Checksum-verified staging slots with read-after-write retries
//! - Crash-safe append-only archive segments
//! - Chunked, idempotent migration between pools
//!
//! All pools on one physical medium share a [`device::SharedDevice`] lock held
//! for one logical operation at a time. Async callers go through
//! [`device::run_blocking`].

pub mod archive;
pub mod backend;
pub mod checksum;
pub mod device;
pub mod migrate;
pub mod staging;

pub use archive::{ArchiveLog, ArchivedRecord, SegmentId};
pub use backend::{DirPool, StoragePool};
pub use device::{run_blocking, SharedDevice};
pub use migrate::{MigrationPolicy, MigrationReport, Migrator};
pub use staging::{StagingRecord, StagingStore};
