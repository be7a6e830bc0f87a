pub mod config;
pub mod error;

pub use config::{DetectionConfig, RepographConfig, SearchConfig};
pub use error::{RepographError, Result};
