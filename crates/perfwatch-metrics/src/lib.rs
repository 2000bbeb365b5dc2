use std::sync::Arc;

use perfwatch_core::metrics_api::Comparator;

pub mod delta;
pub mod stats;

pub use delta::DeltaComparator;

pub fn default_comparator() -> Arc<dyn Comparator> {
    Arc::new(DeltaComparator::default())
}
