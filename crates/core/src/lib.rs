pub mod config;
pub mod error;
pub mod severity;

pub use config::Config;
pub use error::*;
pub use severity::Severity;
