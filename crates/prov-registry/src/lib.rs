//! prov-registry — subscription lifecycle for the provisioning bus.
//!
//! [`SubscriptionRegistry`] owns subscriptions and their credentials in the
//! key-value store and provisions the per-subscription queue. The REST glue
//! calls into it for create/delete/get, for authentication and for the
//! prefill status callback. [`MessageReader`] is the subscriber read path:
//! backfill first, then live events.

pub mod error;
pub mod messages;
pub mod password;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use messages::MessageReader;
pub use password::PasswordHasher;
pub use registry::{Registration, SubscriptionRegistry};
