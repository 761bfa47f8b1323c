//! Common interfaces and utilities for the pledged job server
//!
//! This crate provides shared abstractions to break circular dependencies
//! between the subsystem crates while maintaining clean interfaces.

pub mod health;
pub mod metrics;

pub use health::*;
pub use metrics::*;
