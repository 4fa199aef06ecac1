//! Utilities for testing code built on brokers and clients: an in-process transport and a
//!  command executor that records what it was asked to do. They are used for testing this crate
//!  itself, but they are also exported for application testing, which is why they are part of
//!  the regular (non-#[cfg(test)]) code.

pub mod executor;
pub mod transport;
