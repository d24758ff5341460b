//! NatsBroker — the broker collaborator on NATS JetStream.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::{self, PullConsumer, pull};
use async_nats::jetstream::context::{
    CreateStreamError, CreateStreamErrorKind, GetStreamError, GetStreamErrorKind, PublishError,
    PublishErrorKind,
};
use async_nats::jetstream::message::{AckKind, Acker};
use async_nats::jetstream::response::Response;
use async_nats::jetstream::stream::{
    ConsumerErrorKind, DeleteMessageErrorKind, RawMessageErrorKind,
};
use async_nats::jetstream::{self, ErrorCode, stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::debug;

use crate::broker::{
    AckHandle, Broker, ConsumerConfig, Delivery, RetentionPolicy, StoredMessage, StreamConfig,
    StreamInfo,
};
use crate::error::{QueueError, QueueResult};

fn broker_err(e: impl std::fmt::Display) -> QueueError {
    QueueError::Broker(e.to_string())
}

// ── Server error codes ───────────────────────────────────────────

fn stream_lookup_error(name: &str, e: GetStreamError) -> QueueError {
    match e.kind() {
        GetStreamErrorKind::JetStream(api) if api.error_code() == ErrorCode::STREAM_NOT_FOUND => {
            QueueError::StreamNotFound(name.to_string())
        }
        _ => broker_err(e),
    }
}

/// A create that lost the race to another creator reports the name as taken.
fn create_stream_error(name: &str, e: CreateStreamError) -> QueueError {
    match e.kind() {
        CreateStreamErrorKind::JetStream(api) if api.error_code() == ErrorCode::STREAM_NAME_EXIST => {
            QueueError::StreamExists(name.to_string())
        }
        _ => broker_err(e),
    }
}

fn is_missing_message(code: ErrorCode) -> bool {
    code == ErrorCode::NO_MESSAGE_FOUND || code == ErrorCode::SEQUENCE_NOT_FOUND
}

/// A publish answered without a stream, or by a stream other than the
/// expected one, means the target stream is gone.
fn publish_error(stream_name: &str, e: PublishError) -> QueueError {
    if e.kind() == PublishErrorKind::StreamNotFound {
        return QueueError::StreamNotFound(stream_name.to_string());
    }
    let code = std::error::Error::source(&e)
        .and_then(|source| source.downcast_ref::<jetstream::Error>())
        .map(jetstream::Error::error_code);
    match code {
        Some(code) if code == ErrorCode::STREAM_NOT_MATCH || code == ErrorCode::STREAM_NOT_FOUND => {
            QueueError::StreamNotFound(stream_name.to_string())
        }
        Some(code) if code == ErrorCode::STREAM_SEALED => {
            QueueError::Sealed(stream_name.to_string())
        }
        _ => broker_err(e),
    }
}

fn to_nats_retention(retention: RetentionPolicy) -> stream::RetentionPolicy {
    match retention {
        RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
        RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
        RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
    }
}

fn from_nats_retention(retention: stream::RetentionPolicy) -> RetentionPolicy {
    match retention {
        stream::RetentionPolicy::Limits => RetentionPolicy::Limits,
        stream::RetentionPolicy::WorkQueue => RetentionPolicy::WorkQueue,
        stream::RetentionPolicy::Interest => RetentionPolicy::Interest,
    }
}

fn to_nats_stream(config: &StreamConfig) -> stream::Config {
    stream::Config {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        retention: to_nats_retention(config.retention),
        num_replicas: config.num_replicas,
        sealed: config.sealed,
        ..Default::default()
    }
}

fn from_nats_stream(config: &stream::Config) -> StreamConfig {
    StreamConfig {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        retention: from_nats_retention(config.retention),
        num_replicas: config.num_replicas,
        sealed: config.sealed,
    }
}

pub struct NatsBroker {
    js: jetstream::Context,
}

impl NatsBroker {
    pub fn new(js: jetstream::Context) -> Self {
        Self { js }
    }

    async fn stream(&self, name: &str) -> QueueResult<stream::Stream> {
        self.js
            .get_stream(name)
            .await
            .map_err(|e| stream_lookup_error(name, e))
    }

    /// Consumer info straight from the API so a missing consumer is told
    /// apart by its error code.
    async fn consumer_config(
        &self,
        stream_name: &str,
        durable: &str,
    ) -> QueueResult<Option<consumer::Config>> {
        let subject = format!("CONSUMER.INFO.{stream_name}.{durable}");
        let response: Response<consumer::Info> = self
            .js
            .request(subject, &serde_json::json!({}))
            .await
            .map_err(broker_err)?;
        match response {
            Response::Ok(info) => Ok(Some(info.config)),
            Response::Err { error } if error.error_code() == ErrorCode::CONSUMER_NOT_FOUND => {
                Ok(None)
            }
            Response::Err { error } if error.error_code() == ErrorCode::STREAM_NOT_FOUND => {
                Err(QueueError::StreamNotFound(stream_name.to_string()))
            }
            Response::Err { error } => Err(broker_err(error)),
        }
    }

    async fn consumer(
        &self,
        stream: &stream::Stream,
        stream_name: &str,
        durable: &str,
    ) -> QueueResult<PullConsumer> {
        if self.consumer_config(stream_name, durable).await?.is_none() {
            return Err(QueueError::ConsumerNotFound {
                stream: stream_name.to_string(),
                consumer: durable.to_string(),
            });
        }
        stream.get_consumer(durable).await.map_err(broker_err)
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn stream_info(&self, name: &str) -> QueueResult<Option<StreamInfo>> {
        let mut stream = match self.stream(name).await {
            Ok(stream) => stream,
            Err(QueueError::StreamNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let info = stream.info().await.map_err(broker_err)?;
        Ok(Some(StreamInfo {
            config: from_nats_stream(&info.config),
            messages: info.state.messages,
        }))
    }

    async fn add_stream(&self, config: &StreamConfig) -> QueueResult<()> {
        if self.stream_info(&config.name).await?.is_some() {
            return Err(QueueError::StreamExists(config.name.clone()));
        }
        self.js
            .create_stream(to_nats_stream(config))
            .await
            .map_err(|e| create_stream_error(&config.name, e))?;
        Ok(())
    }

    async fn update_stream(&self, config: &StreamConfig) -> QueueResult<()> {
        match self.js.update_stream(to_nats_stream(config)).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(
                e.kind(),
                CreateStreamErrorKind::JetStream(api) if api.error_code() == ErrorCode::STREAM_NOT_FOUND
            ) =>
            {
                Err(QueueError::StreamNotFound(config.name.clone()))
            }
            // Anything the server answered with is a refusal of this config.
            Err(e) => Err(QueueError::Rejected {
                stream: config.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn delete_stream(&self, name: &str) -> QueueResult<bool> {
        match self.js.delete_stream(name).await {
            Ok(_) => Ok(true),
            Err(e) => match stream_lookup_error(name, e) {
                QueueError::StreamNotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn consumer_info(
        &self,
        stream_name: &str,
        durable: &str,
    ) -> QueueResult<Option<ConsumerConfig>> {
        let config = self.consumer_config(stream_name, durable).await?;
        Ok(config.map(|config| ConsumerConfig {
            durable_name: durable.to_string(),
            max_ack_pending: config.max_ack_pending,
            ack_wait: config.ack_wait,
        }))
    }

    async fn add_consumer(&self, stream_name: &str, config: &ConsumerConfig) -> QueueResult<()> {
        let stream = self.stream(stream_name).await?;
        stream
            .create_consumer(pull::Config {
                durable_name: Some(config.durable_name.clone()),
                max_ack_pending: config.max_ack_pending,
                ack_wait: config.ack_wait,
                ack_policy: consumer::AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(broker_err)?;
        Ok(())
    }

    async fn delete_consumer(&self, stream_name: &str, durable: &str) -> QueueResult<bool> {
        let stream = self.stream(stream_name).await?;
        match stream.delete_consumer(durable).await {
            Ok(_) => Ok(true),
            Err(e) if matches!(
                e.kind(),
                ConsumerErrorKind::JetStream(api) if api.error_code() == ErrorCode::CONSUMER_NOT_FOUND
            ) =>
            {
                Ok(false)
            }
            Err(e) => Err(broker_err(e)),
        }
    }

    async fn publish(&self, stream_name: &str, subject: &str, payload: Bytes) -> QueueResult<u64> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Expected-Stream", stream_name);
        let ack = self
            .js
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(|e| publish_error(stream_name, e))?
            .await
            .map_err(|e| publish_error(stream_name, e))?;
        Ok(ack.sequence)
    }

    async fn fetch(
        &self,
        stream_name: &str,
        durable: &str,
        filter_subject: Option<&str>,
        timeout: Duration,
    ) -> QueueResult<Option<Delivery>> {
        let stream = self.stream(stream_name).await?;
        let mut consumer = self.consumer(&stream, stream_name, durable).await?;

        // A pull consumer carries a single filter; retarget it when asked
        // for a different subject.
        let wanted = filter_subject.unwrap_or_default().to_string();
        let current = consumer.cached_info().config.clone();
        if current.filter_subject != wanted {
            debug!(stream = %stream_name, consumer = %durable, filter = %wanted, "retargeting consumer filter");
            consumer = stream
                .create_consumer(pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: wanted,
                    max_ack_pending: current.max_ack_pending,
                    ack_wait: current.ack_wait,
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                })
                .await
                .map_err(broker_err)?;
        }

        let mut batch = consumer
            .fetch()
            .max_messages(1)
            .expires(timeout.max(Duration::from_millis(100)))
            .messages()
            .await
            .map_err(broker_err)?;
        let Some(next) = batch.next().await else {
            return Ok(None);
        };
        let message = next.map_err(broker_err)?;
        let (sequence, num_delivered) = {
            let info = message.info().map_err(broker_err)?;
            (info.stream_sequence, info.delivered.max(1) as u64)
        };
        let subject = message.subject.to_string();
        let payload = message.payload.clone();
        let (_, acker) = message.split();
        Ok(Some(Delivery {
            subject,
            payload,
            sequence,
            num_delivered,
            acker: Arc::new(NatsAcker { acker }),
        }))
    }

    async fn get_msg(&self, stream_name: &str, seq: u64) -> QueueResult<Option<StoredMessage>> {
        let stream = self.stream(stream_name).await?;
        match stream.get_raw_message(seq).await {
            Ok(raw) => Ok(Some(StoredMessage {
                subject: raw.subject.to_string(),
                payload: raw.payload,
                sequence: raw.sequence,
            })),
            Err(e) => match e.kind() {
                RawMessageErrorKind::NoMessageFound => Ok(None),
                RawMessageErrorKind::JetStream(api) if is_missing_message(api.error_code()) => {
                    Ok(None)
                }
                _ => Err(broker_err(e)),
            },
        }
    }

    async fn delete_msg(&self, stream_name: &str, seq: u64) -> QueueResult<bool> {
        let stream = self.stream(stream_name).await?;
        match stream.delete_message(seq).await {
            Ok(deleted) => Ok(deleted),
            Err(e) if matches!(
                e.kind(),
                DeleteMessageErrorKind::JetStream(api) if is_missing_message(api.error_code())
            ) =>
            {
                Ok(false)
            }
            Err(e) => Err(broker_err(e)),
        }
    }

    async fn purge(&self, stream_name: &str, subject: &str) -> QueueResult<u64> {
        let stream = self.stream(stream_name).await?;
        let response = stream
            .purge()
            .filter(subject)
            .await
            .map_err(broker_err)?;
        Ok(response.purged)
    }
}

struct NatsAcker {
    acker: Acker,
}

#[async_trait]
impl AckHandle for NatsAcker {
    async fn ack(&self) -> QueueResult<()> {
        self.acker.ack().await.map_err(broker_err)
    }

    async fn nak(&self) -> QueueResult<()> {
        self.acker.ack_with(AckKind::Nak(None)).await.map_err(broker_err)
    }

    async fn in_progress(&self) -> QueueResult<()> {
        self.acker.ack_with(AckKind::Progress).await.map_err(broker_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(err_code: u64, description: &str) -> jetstream::Error {
        serde_json::from_value(serde_json::json!({
            "code": 404,
            "err_code": err_code,
            "description": description,
        }))
        .unwrap()
    }

    #[test]
    fn test_publish_without_stream_is_stream_not_found() {
        let err = publish_error("SUB_gone", PublishError::from(PublishErrorKind::StreamNotFound));
        assert!(matches!(err, QueueError::StreamNotFound(name) if name == "SUB_gone"));
    }

    #[test]
    fn test_publish_timeout_is_broker_error() {
        let err = publish_error("SUB_a", PublishError::from(PublishErrorKind::TimedOut));
        assert!(matches!(err, QueueError::Broker(_)));
    }

    #[test]
    fn test_stream_lookup_classified_by_code() {
        let missing = GetStreamError::from(GetStreamErrorKind::JetStream(api_error(
            10059,
            "stream not found",
        )));
        assert!(matches!(
            stream_lookup_error("INGEST", missing),
            QueueError::StreamNotFound(name) if name == "INGEST"
        ));

        // A description mentioning "not found" is not enough.
        let other = GetStreamError::from(GetStreamErrorKind::JetStream(api_error(
            10008,
            "account not found",
        )));
        assert!(matches!(stream_lookup_error("INGEST", other), QueueError::Broker(_)));
    }

    #[test]
    fn test_concurrent_create_is_stream_exists() {
        let taken = CreateStreamError::from(api_error(10058, "stream name already in use"));
        assert!(matches!(
            create_stream_error("stream:ox", taken),
            QueueError::StreamExists(name) if name == "stream:ox"
        ));
        let refused = CreateStreamError::from(api_error(10052, "replicas > 1 not supported"));
        assert!(matches!(create_stream_error("stream:ox", refused), QueueError::Broker(_)));
    }

    #[test]
    fn test_missing_message_codes() {
        assert!(is_missing_message(ErrorCode::NO_MESSAGE_FOUND));
        assert!(is_missing_message(ErrorCode::SEQUENCE_NOT_FOUND));
        assert!(!is_missing_message(ErrorCode::STREAM_NOT_FOUND));
    }
}
