//! prov-dispatcher — fan-out of inbound events to subscriber queues.
//!
//! The [`Dispatcher`] pulls events one at a time from the shared
//! `incoming` queue and publishes a copy to the main subject of every
//! subscription whose realm/topic patterns match. Matching only consults
//! an in-memory [`RoutingTable`], which a background task rebuilds from
//! the `subscriptions` bucket whenever it changes.

pub mod error;
pub mod routing;
pub mod service;

pub use error::{DispatchError, DispatchResult};
pub use routing::RoutingTable;
pub use service::Dispatcher;
