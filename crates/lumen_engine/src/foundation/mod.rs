//! Foundation module - Core utilities and types
//!
//! - Logging setup
//! - Explicitly constructed values

pub mod deferred;
pub mod logging;
