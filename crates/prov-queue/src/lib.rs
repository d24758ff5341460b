//! prov-queue — durable queues for the provisioning bus.
//!
//! # Components
//!
//! - **`broker`** — the [`Broker`] collaborator interface: streams,
//!   durable pull consumers and per-delivery acknowledgement.
//! - **`memory`** — [`MemoryBroker`], an in-process broker honouring
//!   retention, ack-wait and single-in-flight delivery.
//! - **`nats`** — [`NatsBroker`] on NATS JetStream.
//! - **`queue`** — [`QueueSpec`], how logical queues map to streams.
//! - **`adapter`** — [`QueueAdapter`]: idempotent provisioning, the
//!   retention migration protocol and message operations.
//! - **`ack_wait`** — [`AckWaitSupervisor`], keeps long handlers from
//!   being redelivered while they work.

pub mod ack_wait;
pub mod adapter;
pub mod broker;
pub mod error;
pub mod memory;
pub mod nats;
pub mod queue;

pub use ack_wait::AckWaitSupervisor;
pub use adapter::{Acknowledgements, MqMessage, PullSubscription, QueueAdapter, QueueStatus};
pub use broker::{
    AckHandle, Broker, ConsumerConfig, Delivery, RetentionPolicy, StoredMessage, StreamConfig,
    StreamInfo,
};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryBroker;
pub use nats::NatsBroker;
pub use queue::QueueSpec;
