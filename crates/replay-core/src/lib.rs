pub mod cases;
pub mod config;
pub mod grouper;
pub mod report;
pub mod status;
pub mod types;

pub use config::Config;
pub use report::ReportWriter;
pub use status::{ExecutionStatus, LogEntry, LogLevel, Progress, RunPhase, Statistics, StatusBoard};
pub use types::*;
