//! prov-core — shared model for the provisioning bus.
//!
//! Holds everything the services agree on without talking to a broker:
//! the event envelope and its wrappers, subscriptions and their prefill
//! lifecycle, the naming of queues and subjects, and the `provd.toml`
//! configuration.

pub mod config;
pub mod constants;
pub mod error;
pub mod message;
pub mod subscription;

pub use config::ProvConfig;
pub use error::{ModelError, ModelResult};
pub use message::*;
pub use subscription::*;
