pub mod dataset;
pub mod fetcher;
pub mod persistence;
pub mod preprocess;
pub mod stream;
pub mod trade_buffer;

// Re-export the entry types for convenient access (e.g. `use crate::market_data::Preprocessor`).
pub use preprocess::Preprocessor;
pub use stream::StreamingHandler;
