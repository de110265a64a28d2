//! `webctl` Core Library
//!
//! Shared functionality for `webctl` components:
//! - Configuration resolution and hierarchy
//! - Common error types
//! - Tracing subscriber setup

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, ExpiryPolicy};
pub use error::{Error, Result};
