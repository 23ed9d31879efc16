//! Activity logging module with async queue mechanism

mod logger;
pub mod types;

pub use logger::{ActivityLogger, ActivitySink, LoggerConfig, MemorySink, TracingSink};
pub use types::{ActivityLog, ActivityStatus, ActivityType};
