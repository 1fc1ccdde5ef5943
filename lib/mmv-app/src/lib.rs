//! Application bootstrap helpers: loading configuration and initializing logging.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod config;
pub mod logging;

/// A generic error.
pub type GenericError = anyhow::Error;
