//! Background workers
//!
//! Responsibilities:
//! - Run block downloads and uploads on a fixed pool of tokio tasks fed by a
//!   foreground (sync) and a background (async) queue.
//! - Drive periodic maintenance: buffer reclamation and write-back
//!   scheduling.
//! - Stop cleanly when the engine shuts down.
//!
//! Submodules:
//! - `worker`: task type, queues and transfer execution
//! - `maintenance`: interval loop calling into the engine
pub mod maintenance;
pub mod worker;
