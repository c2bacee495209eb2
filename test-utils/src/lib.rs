//! Shared test utilities for the Vault client cache.
//!
//! This crate provides:
//! - Proptest generators for cache keys, object keys and lease durations
//! - Mock clients, client factories, transit and event recorders
//! - Seeded object stores and sample Vault responses

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod mocks;

pub use fixtures::*;
pub use generators::*;
pub use mocks::*;
