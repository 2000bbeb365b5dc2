pub mod rows;
pub mod schema;
pub mod store;
pub mod suite;

pub use store::{Store, StoreStats};
pub use suite::{SuiteConn, SuiteCounts, SuiteDb};
