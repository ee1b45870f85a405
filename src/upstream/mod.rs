pub mod history;
pub mod normalize;
pub mod stream;
pub mod symbols;

pub use history::{HistoryFetcher, HistoryRequest, MAX_LIMIT};
pub use stream::LiveFeed;
pub use symbols::SymbolResolver;
