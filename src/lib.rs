#![forbid(unsafe_code)]

pub mod agent;
pub mod config;
pub mod errors;
pub mod executor;
pub mod models;
pub mod module_source;
pub mod session;
pub mod update;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
