pub mod config;
pub mod error;
pub mod server;
pub mod types;
pub mod upstream;

pub use error::{MarketDataError, Result};
pub use types::*;
