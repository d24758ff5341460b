//! Naming conventions shared by every service on the bus.

/// Shared ingestion queue the producers write to.
pub const INCOMING_QUEUE: &str = "incoming";

/// Queue carrying prefill requests from the registry to the prefill service.
pub const PREFILL_QUEUE: &str = "prefill";

/// Quarantine for prefill requests that ran out of attempts.
pub const PREFILL_FAILURES_QUEUE: &str = "prefill-failures";

/// The only realm the prefill service knows how to backfill.
pub const UDM_REALM: &str = "udm";

/// Physical stream id of a logical queue.
pub fn stream_name(queue: &str) -> String {
    format!("stream:{queue}")
}

/// Durable consumer id of a logical queue.
pub fn durable_name(queue: &str) -> String {
    format!("durable_name:{queue}")
}

/// Subject carrying live events for a subscription.
pub fn main_subject(subscription: &str) -> String {
    format!("{subscription}.main")
}

/// Subject carrying backfill events for a subscription.
pub fn prefill_subject(subscription: &str) -> String {
    format!("{subscription}.prefill")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(stream_name("incoming"), "stream:incoming");
        assert_eq!(durable_name("incoming"), "durable_name:incoming");
        assert_eq!(main_subject("ox"), "ox.main");
        assert_eq!(prefill_subject("ox"), "ox.prefill");
    }
}
