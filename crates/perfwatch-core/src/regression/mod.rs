//! Change detection and regression triage.

pub mod detect;
pub mod lifecycle;
pub mod records;
pub mod title;

pub use detect::{intervals_overlap, Analysis, AnalysisMode};
pub use lifecycle::{transition_allowed, TriagePolicy, PLACEHOLDER_TITLE};
pub use records::{ChangeFilter, NewFieldChange};
pub use title::{format_title, short_name};
