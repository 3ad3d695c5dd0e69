//! # Cachetable Configuration Module
//!
//! This module centralizes the tunables of the cachetable. Constants are
//! grouped by the subsystem that consumes them, and relationships between
//! them are enforced through compile-time assertions.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency documentation

pub mod constants;
pub use constants::*;
