//! Client side of the Queuey message queue service.
use std::time;

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::partition::{Cursor, PartitionName};

/// Enumeration of errors returned by the queue service or while talking to it.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("request to the queue service failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("queue service responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("not found in the queue service: {0}")]
    NotFound(String),
    #[error("failed to parse queue service response: {0}")]
    Parse(String),
    #[error("application key is not a valid header value")]
    InvalidAppKey,
    #[error("queue service is unavailable")]
    Unavailable,
}

impl QueueError {
    /// The HTTP status code of the response that caused this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            QueueError::Status { status, .. } => Some(*status),
            QueueError::NotFound(_) => Some(404),
            QueueError::Request(error) => error.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Order in which messages are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

impl Order {
    pub fn as_str(&self) -> &'static str {
        match self {
            Order::Ascending => "ascending",
            Order::Descending => "descending",
        }
    }
}

/// A queue as reported by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueInfo {
    #[serde(rename = "queue_name")]
    pub queue_id: String,
    pub partitions: u32,
}

impl QueueInfo {
    pub fn partition_names(&self) -> Vec<PartitionName> {
        (1..=self.partitions)
            .filter_map(|index| PartitionName::new(&self.queue_id, index).ok())
            .collect()
    }
}

/// A message read from a partition. Never modified after it is fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub body: String,
    pub partition: PartitionName,
    pub timestamp: Cursor,
}

/// Acknowledgement of a posted message.
#[derive(Debug, Clone, PartialEq)]
pub struct PostedMessage {
    pub key: String,
    pub partition: PartitionName,
    pub timestamp: Cursor,
}

/// The operations the worker needs from the queue service.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// List every queue of the application along with its partition count.
    async fn list_queues(&self) -> Result<Vec<QueueInfo>, QueueError>;

    async fn create_queue(&self, queue_id: &str, partitions: u32) -> Result<(), QueueError>;

    /// Fetch up to `limit` messages newer than `since`.
    async fn messages(
        &self,
        partition: &PartitionName,
        since: &Cursor,
        limit: usize,
        order: Order,
    ) -> Result<Vec<Message>, QueueError>;

    async fn post(
        &self,
        partition: &PartitionName,
        body: String,
        ttl: time::Duration,
    ) -> Result<PostedMessage, QueueError>;

    /// Replace the body of an existing message, keeping its key.
    async fn update(
        &self,
        partition: &PartitionName,
        key: &str,
        body: String,
        ttl: time::Duration,
    ) -> Result<(), QueueError>;
}

#[derive(Deserialize)]
struct QueueListing {
    queues: Vec<QueueInfo>,
}

#[derive(Deserialize)]
struct MessageListing {
    messages: Vec<WireMessage>,
}

#[derive(Deserialize)]
struct WireMessage {
    message_id: String,
    #[serde(deserialize_with = "deserialize_cursor")]
    timestamp: Cursor,
    partition: u32,
    body: String,
}

#[derive(Deserialize)]
struct PostResponse {
    messages: Vec<WirePosted>,
}

#[derive(Deserialize)]
struct WirePosted {
    key: String,
    #[serde(deserialize_with = "deserialize_cursor")]
    timestamp: Cursor,
    partition: u32,
}

/// Timestamps come back as JSON numbers, but we keep cursors as opaque strings.
fn deserialize_cursor<'de, D>(deserializer: D) -> Result<Cursor, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => Ok(Cursor::new(n.to_string())),
        serde_json::Value::String(s) => Ok(Cursor::new(s)),
        other => Err(serde::de::Error::custom(format!(
            "expected a timestamp, got {other}"
        ))),
    }
}

/// HTTP client for a Queuey application.
#[derive(Clone)]
pub struct QueueyClient {
    client: reqwest::Client,
    root_url: String,
    application_url: String,
}

impl QueueyClient {
    pub fn new(
        url: &str,
        application: &str,
        app_key: &str,
        timeout: time::Duration,
    ) -> Result<Self, QueueError> {
        let mut headers = header::HeaderMap::new();
        let authorization = header::HeaderValue::from_str(&format!("Application {app_key}"))
            .map_err(|_| QueueError::InvalidAppKey)?;
        headers.insert(header::AUTHORIZATION, authorization);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("qdo worker")
            .timeout(timeout)
            .build()?;

        let root_url = url.trim_end_matches('/').to_owned();
        let application_url = format!("{root_url}/v1/{application}");

        Ok(Self {
            client,
            root_url,
            application_url,
        })
    }

    /// Check the service answers at all before we start consuming.
    pub async fn heartbeat(&self) -> Result<(), QueueError> {
        let response = self
            .client
            .get(format!("{}/__heartbeat__", self.root_url))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    fn queue_url(&self, queue_id: &str) -> String {
        format!("{}/{}", self.application_url, queue_id)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, QueueError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        Err(QueueError::NotFound(body))
    } else {
        Err(QueueError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, QueueError> {
    response
        .json::<T>()
        .await
        .map_err(|error| QueueError::Parse(error.to_string()))
}

fn ttl_header(ttl: time::Duration) -> String {
    ttl.as_secs().to_string()
}

#[async_trait]
impl QueueService for QueueyClient {
    async fn list_queues(&self) -> Result<Vec<QueueInfo>, QueueError> {
        let response = self
            .client
            .get(&self.application_url)
            .query(&[("details", "true")])
            .send()
            .await?;
        let listing: QueueListing = parse_json(check_status(response).await?).await?;

        Ok(listing.queues)
    }

    async fn create_queue(&self, queue_id: &str, partitions: u32) -> Result<(), QueueError> {
        debug!(queue_id, partitions, "creating queue");
        let response = self
            .client
            .post(&self.application_url)
            .query(&[
                ("queue_name", queue_id.to_owned()),
                ("partitions", partitions.to_string()),
            ])
            .send()
            .await?;
        check_status(response).await?;

        Ok(())
    }

    async fn messages(
        &self,
        partition: &PartitionName,
        since: &Cursor,
        limit: usize,
        order: Order,
    ) -> Result<Vec<Message>, QueueError> {
        let response = self
            .client
            .get(self.queue_url(partition.queue_id()))
            .query(&[
                ("since", since.as_str().to_owned()),
                ("limit", limit.to_string()),
                ("order", order.as_str().to_owned()),
                ("partitions", partition.index().to_string()),
            ])
            .send()
            .await?;
        let listing: MessageListing = parse_json(check_status(response).await?).await?;

        listing
            .messages
            .into_iter()
            .map(|m| {
                let partition = PartitionName::new(partition.queue_id(), m.partition)
                    .map_err(|error| QueueError::Parse(error.to_string()))?;
                Ok(Message {
                    message_id: m.message_id,
                    body: m.body,
                    partition,
                    timestamp: m.timestamp,
                })
            })
            .collect()
    }

    async fn post(
        &self,
        partition: &PartitionName,
        body: String,
        ttl: time::Duration,
    ) -> Result<PostedMessage, QueueError> {
        let response = self
            .client
            .post(self.queue_url(partition.queue_id()))
            .header("X-TTL", ttl_header(ttl))
            .header("X-Partition", partition.index().to_string())
            .body(body)
            .send()
            .await?;
        let posted: PostResponse = parse_json(check_status(response).await?).await?;

        let first = posted
            .messages
            .into_iter()
            .next()
            .ok_or_else(|| QueueError::Parse("no message in post response".to_owned()))?;
        let partition = PartitionName::new(partition.queue_id(), first.partition)
            .map_err(|error| QueueError::Parse(error.to_string()))?;

        Ok(PostedMessage {
            key: first.key,
            partition,
            timestamp: first.timestamp,
        })
    }

    async fn update(
        &self,
        partition: &PartitionName,
        key: &str,
        body: String,
        ttl: time::Duration,
    ) -> Result<(), QueueError> {
        let url = format!(
            "{}/{}:{}",
            self.queue_url(partition.queue_id()),
            partition.index(),
            key
        );
        let response = self
            .client
            .put(url)
            .header("X-TTL", ttl_header(ttl))
            .body(body)
            .send()
            .await?;
        check_status(response).await?;

        Ok(())
    }
}
