//! Prefill service loop.

use std::sync::Arc;
use std::time::Duration;

use prov_core::config::PrefillConfig;
use prov_core::constants::{PREFILL_FAILURES_QUEUE, UDM_REALM, prefill_subject};
use prov_core::{Body, FillQueueStatus, Message, PrefillRequest, PublisherName, topic_regex};
use prov_queue::{
    AckWaitSupervisor, Acknowledgements, MqMessage, QueueAdapter, QueueError, QueueSpec,
};
use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::PrefillResult;
use crate::retry::RetryPolicy;
use crate::source::{ObjectSource, ObjectType};
use crate::status::{ReportError, StatusReporter};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How a prefill request was settled. Every outcome acknowledges the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefillOutcome {
    Completed { published: usize },
    /// Moved to the failures queue; the subscription is marked failed.
    Quarantined,
    /// Subscription gone, or its prefill already finished.
    Dropped,
}

pub struct PrefillService {
    queues: QueueAdapter,
    source: Arc<dyn ObjectSource>,
    reporter: Arc<dyn StatusReporter>,
    supervisor: AckWaitSupervisor,
    retry: RetryPolicy,
    attempt_limit: Option<u64>,
    poll_timeout: Duration,
}

impl PrefillService {
    pub fn new(
        queues: QueueAdapter,
        source: Arc<dyn ObjectSource>,
        reporter: Arc<dyn StatusReporter>,
        supervisor: AckWaitSupervisor,
        config: &PrefillConfig,
    ) -> Self {
        Self {
            queues,
            source,
            reporter,
            supervisor,
            retry: RetryPolicy::from_config(config),
            attempt_limit: config.attempt_limit(),
            poll_timeout: config.poll_timeout(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Run until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> PrefillResult<()> {
        self.queues
            .ensure_stream(&QueueSpec::prefill_failures(), false)
            .await?;
        let (_, requests) = self
            .queues
            .initialize_subscription(&QueueSpec::prefill(), false)
            .await?;
        info!(attempt_limit = ?self.attempt_limit, "prefill service started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("prefill service shutting down");
                    break;
                }
                polled = requests.get_one_message(self.poll_timeout) => match polled {
                    Ok(Some((message, acks))) => self.handle(message, acks).await,
                    Ok(None) => debug!("no prefill request"),
                    Err(e) => {
                        error!(error = %e, "failed to pull prefill request");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                },
            }
        }
        Ok(())
    }

    async fn handle(&self, message: MqMessage, acks: Acknowledgements) {
        let seq = message.sequence_number;
        let outcome = self
            .supervisor
            .process(&acks, self.process_request(&message))
            .await;
        let settled = match outcome {
            Ok(outcome) => {
                info!(seq, ?outcome, "prefill request settled");
                acks.ack().await
            }
            Err(e) => {
                error!(seq, num_delivered = message.num_delivered, error = %e, "prefill failed, requesting redelivery");
                acks.nak().await
            }
        };
        if let Err(e) = settled {
            error!(seq, error = %e, "failed to settle prefill request");
        }
    }

    /// Work one request. An error means the request should be redelivered.
    pub async fn process_request(&self, message: &MqMessage) -> PrefillResult<PrefillOutcome> {
        let seq = message.sequence_number;
        let request = match PrefillRequest::from_slice(&message.data) {
            Ok(request) => request,
            Err(e) => {
                warn!(seq, error = %e, "unreadable prefill request");
                self.quarantine(message).await?;
                return Ok(PrefillOutcome::Quarantined);
            }
        };
        let name = request.subscription_name.as_str();

        if let Some(limit) = self.attempt_limit
            && message.num_delivered > limit
        {
            warn!(subscription = %name, num_delivered = message.num_delivered, limit, "prefill attempts exhausted");
            return self.give_up(message, name).await;
        }

        let mut patterns = Vec::new();
        for rt in &request.realms_topics {
            if rt.realm != UDM_REALM {
                warn!(subscription = %name, realm = %rt.realm, topic = %rt.topic, "prefill only covers the udm realm, skipping");
                continue;
            }
            match topic_regex(&rt.topic) {
                Ok(regex) => patterns.push(regex),
                Err(e) => {
                    warn!(subscription = %name, error = %e, "prefill request with unusable topic");
                    return self.give_up(message, name).await;
                }
            }
        }

        match self.reporter.report(name, FillQueueStatus::Running).await {
            Ok(()) => {}
            Err(ReportError::NotFound(_)) => {
                warn!(subscription = %name, "subscription no longer exists, dropping prefill request");
                return Ok(PrefillOutcome::Dropped);
            }
            Err(ReportError::Rejected(reason)) => {
                info!(subscription = %name, %reason, "prefill already finished, dropping request");
                return Ok(PrefillOutcome::Dropped);
            }
            Err(e) => return Err(e.into()),
        }

        // A retried request starts over.
        let queue = QueueSpec::subscription(name);
        let subject = prefill_subject(name);
        match self.queues.purge_subject(&queue, &subject).await {
            Ok(_) => {}
            Err(QueueError::StreamNotFound(_)) => {
                warn!(subscription = %name, "subscription queue is gone, dropping prefill request");
                return Ok(PrefillOutcome::Dropped);
            }
            Err(e) => return Err(e.into()),
        }

        let published = if patterns.is_empty() {
            0
        } else {
            self.fill(&queue, &subject, &patterns).await?
        };

        match self.reporter.report(name, FillQueueStatus::Done).await {
            Ok(()) => {
                info!(subscription = %name, published, "prefill done");
                Ok(PrefillOutcome::Completed { published })
            }
            Err(ReportError::NotFound(_)) => {
                warn!(subscription = %name, "subscription deleted during prefill");
                Ok(PrefillOutcome::Dropped)
            }
            Err(ReportError::Rejected(reason)) => {
                warn!(subscription = %name, %reason, "could not mark prefill done");
                Ok(PrefillOutcome::Completed { published })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fill(&self, queue: &QueueSpec, subject: &str, patterns: &[Regex]) -> PrefillResult<usize> {
        let types = self
            .retry
            .run("list object types", || self.source.list_object_types())
            .await?;

        let mut published = 0;
        for pattern in patterns {
            let matching: Vec<&ObjectType> =
                types.iter().filter(|t| pattern.is_match(&t.name)).collect();
            if matching.is_empty() {
                warn!(pattern = %pattern, "no object type matches topic");
            }
            for object_type in matching {
                published += self.fill_type(queue, subject, &object_type.name).await?;
            }
        }
        Ok(published)
    }

    async fn fill_type(&self, queue: &QueueSpec, subject: &str, object_type: &str) -> PrefillResult<usize> {
        let urls = self
            .retry
            .run("list objects", || self.source.list_object_urls(object_type))
            .await?;
        info!(object_type, objects = urls.len(), "filling object type");

        for url in &urls {
            let object = self
                .retry
                .run("get object", || self.source.get_object(url))
                .await?;
            let event = Message::new(
                PublisherName::UdmPrefill,
                UDM_REALM,
                object_type,
                Body::created(object),
            );
            self.queues.add_message(queue, subject, &event).await?;
            debug!(object_type, %url, "object queued");
        }
        Ok(urls.len())
    }

    /// Quarantine the request and mark the subscription failed.
    async fn give_up(&self, message: &MqMessage, name: &str) -> PrefillResult<PrefillOutcome> {
        self.quarantine(message).await?;
        match self.reporter.report(name, FillQueueStatus::Failed).await {
            Ok(()) => {}
            Err(ReportError::NotFound(_)) => {
                warn!(subscription = %name, "subscription no longer exists");
            }
            Err(e) => {
                error!(subscription = %name, error = %e, "could not mark prefill failed");
            }
        }
        Ok(PrefillOutcome::Quarantined)
    }

    async fn quarantine(&self, message: &MqMessage) -> PrefillResult<()> {
        let seq = self
            .queues
            .add_raw(
                &QueueSpec::prefill_failures(),
                PREFILL_FAILURES_QUEUE,
                message.data.clone(),
            )
            .await?;
        warn!(request_seq = message.sequence_number, failures_seq = seq, "prefill request quarantined");
        Ok(())
    }
}
