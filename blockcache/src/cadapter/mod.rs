//! Remote store adapters (cAdapter)
//!
//! Submodules:
//! - `client`: the [`RemoteStore`] trait and its error/attribute types
//! - `memory`: in-process store used by tests and demos
//! - `localfs`: local directory store that mimics stage/commit semantics
//!
//! Responsibilities summary:
//! - Stage blocks under ids, commit ordered id lists, read byte ranges.
//! - Report the committed block list and object attributes.
pub mod client;
pub mod localfs;
pub mod memory;

pub use client::{CommittedBlock, ObjectAttr, RemoteError, RemoteStore};
pub use localfs::LocalFsStore;
pub use memory::MemoryStore;
