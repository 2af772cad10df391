//! Admission-controlled, cached HTTP gateway for the Zeo++ tool (library crate).
//!
//! Re-exports public modules for integration tests and external use.

pub mod admission;
pub mod analysis;
pub mod cache;
pub mod config;
pub mod constants;
pub mod env;
pub mod logging;
pub mod models;
pub mod runner;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod upload;
