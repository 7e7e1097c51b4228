//! File records and the handle registry
//!
//! Submodules:
//! - `file`: per-file block list, size and sync bookkeeping
//! - `registry`: path/handle lookup; a file lives while it has open handles
pub mod file;
pub mod registry;

pub use file::{File, ListState};
pub use registry::{FileRegistry, HandleId};
