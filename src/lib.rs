//! Batch media generation engine.
//!
//! Jobs are queued in FIFO order and executed by a fixed pool of worker
//! threads. Each worker is bound to one authenticated browser profile for its
//! whole lifetime and drives that profile's session through the generation
//! pipeline: configure, submit, poll the shared feed, and retrieve the
//! artifacts the submission produced.

pub mod config;
pub mod models;
pub mod services;
