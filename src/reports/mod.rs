//! Crowd reports: the store contract, aggregation into a vote tally, and
//! rate-limited submission.

pub mod aggregate;
pub mod geo;
pub mod store;
pub mod submit;

// Re-export commonly used types
pub use aggregate::{matches_proximity, tally_reports, ReportAggregator};
pub use geo::distance_m;
pub use store::{CrowdReport, MemoryReportStore, ReportStore, StoreError};
pub use submit::{ReportSubmitter, SubmitError};
