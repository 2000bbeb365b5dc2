pub mod config;
pub mod engine;
pub mod errors;
pub mod ingest;
pub mod logging;
pub mod metrics_api;
pub mod model;
pub mod ordering;
pub mod regression;
pub mod report;
pub mod schema;
pub mod storage;

pub use engine::Instance;
pub use storage::{Store, SuiteDb};
