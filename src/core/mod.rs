// Public modules
pub mod artifact;
pub mod build;
pub mod config;
pub mod defaults;
pub mod deploy;
pub mod deps;
pub mod error;
pub mod fetch;
pub mod keystore;
pub mod ledger;
pub mod logs;
pub mod paths;
pub mod pipeline;
pub mod resolve;
pub mod sign;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
