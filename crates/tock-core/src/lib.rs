//! `tock-core`: configuration and error types shared by every tock crate.

pub mod config;
pub mod error;

pub use config::TockConfig;
pub use error::{Result, TockError};
