//! prov-prefill — backfill of new subscriptions.
//!
//! The [`PrefillService`] consumes prefill requests from the `prefill`
//! queue. For each requested `udm` topic it asks the [`ObjectSource`] for
//! every matching object and publishes it to the subscription's prefill
//! subject, then marks the subscription's prefill as done. Requests that
//! keep failing end up in the `prefill-failures` queue.

pub mod error;
pub mod retry;
pub mod service;
pub mod source;
pub mod status;

pub use error::{PrefillError, PrefillResult};
pub use retry::RetryPolicy;
pub use service::{PrefillOutcome, PrefillService};
pub use source::{ObjectSource, ObjectType, SourceError, SourceResult, UdmRestSource};
pub use status::{ReportError, StatusReporter};
