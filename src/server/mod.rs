pub mod ohlc;

pub use ohlc::{router, AppState};
