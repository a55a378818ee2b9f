//! CLI command implementations
//!
//! Device commands are generic over the access backend so they run the same
//! against real hardware and the simulated controller.

pub mod dump;
pub mod firmware;
pub mod memory;
mod progress;
