//! Procwarden core - platform-independent process supervision primitives
//!
//! This crate provides the traits, configuration, error types, and output
//! classifiers that are shared between platform-specific process backends
//! and the supervisor facade.

mod classify;
mod config;
mod error;
mod process;

pub use classify::*;
pub use config::*;
pub use error::*;
pub use process::*;
