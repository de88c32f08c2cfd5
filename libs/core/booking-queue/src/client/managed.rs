//! Managed FIFO queue client.
//!
//! Maps `BookingMessage` onto a managed FIFO queue: `group_key` becomes the
//! message group id and `dedup_id` the deduplication id, so ordering,
//! single-group-in-flight, visibility and deduplication are provided by the
//! service. The wire calls sit behind [`SqsApi`] so the mapping can be
//! tested without the service; the AWS adapter is compiled with the `sqs`
//! feature.

use super::{EnqueueFailure, EnqueueReport, QueueClient};
use crate::config::{QueueConfig, MAX_RECEIVE_BATCH};
use crate::error::QueueError;
use crate::message::{BookingMessage, ReceiptHandle};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};

/// Longest long-poll the service accepts
const MAX_WAIT_SECONDS: u64 = 20;

/// One entry of a batch send
#[derive(Debug, Clone, PartialEq)]
pub struct SqsSendEntry {
    /// Batch-local entry id
    pub id: String,
    pub body: String,
    pub group_id: String,
    pub dedup_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqsSendResult {
    /// (entry id, assigned message id)
    pub successful: Vec<(String, String)>,
    /// (entry id, reason)
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqsReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub receive_count: u32,
    pub sent_timestamp_ms: Option<i64>,
    pub group_id: Option<String>,
    pub dedup_id: Option<String>,
}

/// Wire operations of the managed queue
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SqsApi: Send + Sync {
    async fn send_batch(
        &self,
        queue_url: &str,
        entries: Vec<SqsSendEntry>,
    ) -> Result<SqsSendResult, QueueError>;

    async fn receive(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_seconds: i32,
        visibility_timeout: i32,
    ) -> Result<Vec<SqsReceivedMessage>, QueueError>;

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError>;

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        timeout: i32,
    ) -> Result<(), QueueError>;

    async fn queue_attributes(&self, queue_url: &str) -> Result<(), QueueError>;
}

/// Message body on the wire
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    dedup_id: String,
    group_key: String,
    payload: serde_json::Value,
    enqueued_at: DateTime<Utc>,
}

pub struct ManagedQueueClient<C: SqsApi> {
    api: C,
    queue_url: String,
    visibility_timeout_seconds: i32,
}

impl<C: SqsApi> ManagedQueueClient<C> {
    pub fn new(api: C, config: &QueueConfig) -> Self {
        Self {
            api,
            queue_url: config.queue_url.clone(),
            visibility_timeout_seconds: clamp_i32(config.visibility_timeout_seconds),
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    fn decode(&self, received: SqsReceivedMessage) -> BookingMessage {
        let sent_at = received
            .sent_timestamp_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        let (dedup_id, group_key, payload, enqueued_at) =
            match serde_json::from_str::<Envelope>(&received.body) {
                Ok(envelope) => (
                    envelope.dedup_id,
                    envelope.group_key,
                    envelope.payload,
                    envelope.enqueued_at,
                ),
                Err(e) => {
                    // Undecodable bodies fail validation downstream and are dead-lettered
                    warn!(message_id = %received.message_id, error = %e, "Undecodable message body");
                    (
                        received
                            .dedup_id
                            .unwrap_or_else(|| received.message_id.clone()),
                        received.group_id.unwrap_or_default(),
                        serde_json::Value::String(received.body),
                        sent_at.unwrap_or_else(Utc::now),
                    )
                }
            };

        BookingMessage {
            message_id: received.message_id,
            dedup_id,
            group_key,
            payload,
            receive_count: received.receive_count.max(1),
            enqueued_at,
            receipt_handle: Some(ReceiptHandle::new(received.receipt_handle)),
        }
    }
}

fn clamp_i32(value: u64) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl<C: SqsApi> QueueClient for ManagedQueueClient<C> {
    #[instrument(level = "debug", skip(self, messages), fields(count = messages.len()))]
    async fn enqueue(&self, messages: Vec<BookingMessage>) -> Result<EnqueueReport, QueueError> {
        let mut report = EnqueueReport::default();

        for chunk in messages.chunks(MAX_RECEIVE_BATCH) {
            let mut entries = Vec::with_capacity(chunk.len());
            for (i, message) in chunk.iter().enumerate() {
                let body = serde_json::to_string(&Envelope {
                    dedup_id: message.dedup_id.clone(),
                    group_key: message.group_key.clone(),
                    payload: message.payload.clone(),
                    enqueued_at: message.enqueued_at,
                })?;
                entries.push(SqsSendEntry {
                    id: i.to_string(),
                    body,
                    group_id: message.group_key.clone(),
                    dedup_id: message.dedup_id.clone(),
                });
            }

            let result = self.api.send_batch(&self.queue_url, entries).await?;

            for (entry_id, message_id) in result.successful {
                if entry_id.parse::<usize>().is_ok_and(|i| i < chunk.len()) {
                    report.message_ids.push(message_id);
                }
            }
            for (entry_id, reason) in result.failed {
                let dedup_id = entry_id
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| chunk.get(i))
                    .map(|m| m.dedup_id.clone())
                    .unwrap_or(entry_id);
                warn!(dedup_id = %dedup_id, reason = %reason, "Enqueue rejected");
                report.failures.push(EnqueueFailure { dedup_id, reason });
            }
        }

        Ok(report)
    }

    #[instrument(level = "debug", skip(self))]
    async fn receive_batch(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<BookingMessage>, QueueError> {
        let max = max_messages.clamp(1, MAX_RECEIVE_BATCH) as i32;
        let wait_seconds = wait.as_secs().min(MAX_WAIT_SECONDS) as i32;

        let received = self
            .api
            .receive(
                &self.queue_url,
                max,
                wait_seconds,
                self.visibility_timeout_seconds,
            )
            .await?;

        Ok(received.into_iter().map(|m| self.decode(m)).collect())
    }

    async fn ack(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        self.api.delete(&self.queue_url, handle.as_str()).await
    }

    async fn extend_visibility(
        &self,
        handle: &ReceiptHandle,
        timeout_seconds: u64,
    ) -> Result<(), QueueError> {
        self.api
            .change_visibility(&self.queue_url, handle.as_str(), clamp_i32(timeout_seconds))
            .await
    }

    async fn nack(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        self.api
            .change_visibility(&self.queue_url, handle.as_str(), 0)
            .await
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.api.queue_attributes(&self.queue_url).await
    }
}

#[cfg(feature = "sqs")]
pub use real::AwsSqsApi;

/// AWS SDK adapter (only compiled when the `sqs` feature is enabled).
#[cfg(feature = "sqs")]
mod real {
    use super::{SqsApi, SqsReceivedMessage, SqsSendEntry, SqsSendResult};
    use crate::error::QueueError;
    use async_trait::async_trait;
    use aws_sdk_sqs::Client as SqsClient;
    use aws_sdk_sqs::error::{DisplayErrorContext, SdkError};
    use aws_sdk_sqs::types::{
        MessageSystemAttributeName, QueueAttributeName, SendMessageBatchRequestEntry,
    };
    use tracing::instrument;

    #[derive(Clone)]
    pub struct AwsSqsApi {
        inner: SqsClient,
    }

    impl AwsSqsApi {
        pub fn new(inner: SqsClient) -> Self {
            Self { inner }
        }

        /// Build a client from the default credential chain.
        ///
        /// `AWS_ENDPOINT_URL` points the client at a local emulator.
        pub async fn from_region(region: impl Into<String>) -> Self {
            let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_config::Region::new(region.into()))
                .load()
                .await;
            Self::new(SqsClient::new(&config))
        }
    }

    fn transport_error<E, R>(operation: &str, err: SdkError<E, R>) -> QueueError
    where
        E: std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        QueueError::Unavailable(format!("sqs {operation}: {}", DisplayErrorContext(&err)))
    }

    /// Service-side rejections of a receipt handle mean the delivery is gone
    fn receipt_error<E, R>(operation: &str, err: SdkError<E, R>) -> QueueError
    where
        E: std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        match &err {
            SdkError::ServiceError(_) => {
                QueueError::StaleReceipt(format!("sqs {operation}: {}", DisplayErrorContext(&err)))
            }
            _ => transport_error(operation, err),
        }
    }

    #[async_trait]
    impl SqsApi for AwsSqsApi {
        #[instrument(level = "debug", skip(self, entries))]
        async fn send_batch(
            &self,
            queue_url: &str,
            entries: Vec<SqsSendEntry>,
        ) -> Result<SqsSendResult, QueueError> {
            let entries = entries
                .into_iter()
                .map(|entry| {
                    SendMessageBatchRequestEntry::builder()
                        .id(entry.id)
                        .message_body(entry.body)
                        .message_group_id(entry.group_id)
                        .message_deduplication_id(entry.dedup_id)
                        .build()
                        .map_err(|e| QueueError::InvalidRequest(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let out = self
                .inner
                .send_message_batch()
                .queue_url(queue_url)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| transport_error("send_message_batch", e))?;

            Ok(SqsSendResult {
                successful: out
                    .successful()
                    .iter()
                    .map(|s| (s.id().to_string(), s.message_id().to_string()))
                    .collect(),
                failed: out
                    .failed()
                    .iter()
                    .map(|f| {
                        (
                            f.id().to_string(),
                            format!("{}: {}", f.code(), f.message().unwrap_or_default()),
                        )
                    })
                    .collect(),
            })
        }

        #[instrument(level = "debug", skip(self))]
        async fn receive(
            &self,
            queue_url: &str,
            max_messages: i32,
            wait_seconds: i32,
            visibility_timeout: i32,
        ) -> Result<Vec<SqsReceivedMessage>, QueueError> {
            let out = self
                .inner
                .receive_message()
                .queue_url(queue_url)
                .max_number_of_messages(max_messages)
                .wait_time_seconds(wait_seconds)
                .visibility_timeout(visibility_timeout)
                .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
                .message_system_attribute_names(MessageSystemAttributeName::SentTimestamp)
                .message_system_attribute_names(MessageSystemAttributeName::MessageGroupId)
                .message_system_attribute_names(MessageSystemAttributeName::MessageDeduplicationId)
                .send()
                .await
                .map_err(|e| transport_error("receive_message", e))?;

            let mut messages = Vec::new();
            for m in out.messages() {
                let (Some(message_id), Some(receipt_handle)) = (m.message_id(), m.receipt_handle())
                else {
                    continue;
                };
                let attribute = |name: MessageSystemAttributeName| {
                    m.attributes().and_then(|a| a.get(&name)).cloned()
                };

                messages.push(SqsReceivedMessage {
                    message_id: message_id.to_string(),
                    receipt_handle: receipt_handle.to_string(),
                    body: m.body().unwrap_or_default().to_string(),
                    receive_count: attribute(MessageSystemAttributeName::ApproximateReceiveCount)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(1),
                    sent_timestamp_ms: attribute(MessageSystemAttributeName::SentTimestamp)
                        .and_then(|v| v.parse().ok()),
                    group_id: attribute(MessageSystemAttributeName::MessageGroupId),
                    dedup_id: attribute(MessageSystemAttributeName::MessageDeduplicationId),
                });
            }
            Ok(messages)
        }

        #[instrument(level = "debug", skip(self))]
        async fn delete(&self, queue_url: &str, receipt_handle: &str) -> Result<(), QueueError> {
            self.inner
                .delete_message()
                .queue_url(queue_url)
                .receipt_handle(receipt_handle)
                .send()
                .await
                .map_err(|e| receipt_error("delete_message", e))?;
            Ok(())
        }

        #[instrument(level = "debug", skip(self))]
        async fn change_visibility(
            &self,
            queue_url: &str,
            receipt_handle: &str,
            timeout: i32,
        ) -> Result<(), QueueError> {
            self.inner
                .change_message_visibility()
                .queue_url(queue_url)
                .receipt_handle(receipt_handle)
                .visibility_timeout(timeout)
                .send()
                .await
                .map_err(|e| receipt_error("change_message_visibility", e))?;
            Ok(())
        }

        async fn queue_attributes(&self, queue_url: &str) -> Result<(), QueueError> {
            self.inner
                .get_queue_attributes()
                .queue_url(queue_url)
                .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
                .send()
                .await
                .map_err(|e| transport_error("get_queue_attributes", e))?;
            Ok(())
        }
    }
}
