pub mod config;
pub mod error;
pub mod types;

pub use config::{load_config, AuthgateConfig};
