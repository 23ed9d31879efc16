pub mod aggregator;

pub use aggregator::{StatsKind, UsageStatsAggregator};
