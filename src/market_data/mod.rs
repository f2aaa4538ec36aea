pub mod aggregator;
pub mod bar;

// Re-export the core data types for convenient access (e.g. `use crate::market_data::Bar`).
pub use aggregator::{DataAggregator, IntervalResult, Snapshot};
pub use bar::{Bar, BarSeries};
