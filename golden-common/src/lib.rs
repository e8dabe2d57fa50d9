//! # Motion Golden Common Library
//!
//! Shared code for the golden watcher service:
//! - Error type used by configuration and token handling
//! - Layered configuration (CLI / environment / TOML / compiled default)
//! - Persistent access token store
//! - Identity and freshness hashing

pub mod config;
pub mod error;
pub mod hashing;
pub mod token;

pub use error::{Error, Result};
