pub mod instance;
pub mod worker;

pub use instance::{Instance, Submission};
pub use worker::{run_analysis, spawn_analysis, AnalysisJob, RetryPolicy};
