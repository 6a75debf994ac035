//! The `utils` module provides shared pieces used across `relayq`:
//! the crate-wide error taxonomy and logging setup.

pub mod error;
pub mod logging;
