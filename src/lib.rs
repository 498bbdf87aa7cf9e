//! AGORA — Opinion Market Simulation Engine
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod clock;
pub mod config;
pub mod types;
pub mod market;
pub mod store;
pub mod engine;
pub mod seed;
pub mod dashboard;
