// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! External queue access (SQS-compatible JSON protocol).
//!
//! Requests are plain `POST`s with an `X-Amz-Target` header. They are not
//! SigV4-signed, so the endpoint must be a local emulator (ElasticMQ,
//! LocalStack) or a signing proxy in front of the real service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use super::is_transient_http;

const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
const TARGET_RECEIVE: &str = "AmazonSQS.ReceiveMessage";
const TARGET_DELETE: &str = "AmazonSQS.DeleteMessage";

/// Extra HTTP budget on top of the long-poll wait.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("queue request failed: {0}")]
    Request(String),

    #[error("queue response was invalid: {0}")]
    InvalidResponse(String),

    #[error("queue configuration invalid: {0}")]
    Config(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unreachable(_))
    }
}

/// Receive bounds for one long-poll.
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    pub max_messages: u32,
    pub wait: Duration,
    pub visibility_timeout: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait: Duration::from_secs(10),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a processed message.
    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;
}

// =============================================================================
// SqsClient
// =============================================================================

#[derive(Debug, Deserialize)]
struct ReceiveResponse {
    #[serde(rename = "Messages", default)]
    messages: Vec<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "MessageId", default)]
    message_id: String,
    #[serde(rename = "ReceiptHandle")]
    receipt_handle: String,
    #[serde(rename = "Body", default)]
    body: String,
}

#[derive(Debug, Clone)]
pub struct SqsClient {
    queue_url: String,
    endpoint: String,
    http: Client,
}

impl SqsClient {
    /// `endpoint` defaults to the origin of `queue_url`.
    pub fn new(
        queue_url: &str,
        endpoint: Option<&str>,
        options: &ReceiveOptions,
    ) -> Result<Self, QueueError> {
        let parsed = Url::parse(queue_url)
            .map_err(|e| QueueError::Config(format!("invalid queue URL {queue_url}: {e}")))?;
        let endpoint = match endpoint {
            Some(ep) => ep.trim_end_matches('/').to_string(),
            None => parsed.origin().ascii_serialization(),
        };

        let http = Client::builder()
            .timeout(options.wait + REQUEST_SLACK)
            .build()
            .map_err(|e| QueueError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            queue_url: queue_url.to_string(),
            endpoint,
            http,
        })
    }

    /// Last path segment of the queue URL.
    pub fn queue_name(&self) -> &str {
        self.queue_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.queue_url)
    }

    async fn call(&self, target: &str, payload: Value) -> Result<Value, QueueError> {
        let response = self
            .http
            .post(format!("{}/", self.endpoint))
            .header("X-Amz-Target", target)
            .header("Content-Type", CONTENT_TYPE)
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| {
                if is_transient_http(&e) {
                    QueueError::Unreachable(format!("{target}: {e}"))
                } else {
                    QueueError::Request(format!("{target} failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| QueueError::Unreachable(format!("{target} body read failed: {e}")))?;
        if !status.is_success() {
            if status.is_server_error() {
                return Err(QueueError::Unreachable(format!(
                    "{target} returned {status}: {body}"
                )));
            }
            return Err(QueueError::Request(format!(
                "{target} returned {status}: {body}"
            )));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| QueueError::InvalidResponse(format!("{target} invalid JSON: {e}")))
    }
}

#[async_trait]
impl QueueClient for SqsClient {
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>, QueueError> {
        let payload = json!({
            "QueueUrl": self.queue_url,
            "AttributeNames": ["All"],
            "MessageAttributeNames": ["All"],
            "MaxNumberOfMessages": options.max_messages,
            "VisibilityTimeout": options.visibility_timeout.as_secs(),
            "WaitTimeSeconds": options.wait.as_secs(),
        });
        let value = self.call(TARGET_RECEIVE, payload).await?;
        parse_receive_response(value)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let payload = json!({
            "QueueUrl": self.queue_url,
            "ReceiptHandle": receipt_handle,
        });
        self.call(TARGET_DELETE, payload).await.map(|_| ())
    }
}

fn parse_receive_response(value: Value) -> Result<Vec<QueueMessage>, QueueError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    let response: ReceiveResponse = serde_json::from_value(value)
        .map_err(|e| QueueError::InvalidResponse(format!("ReceiveMessage: {e}")))?;
    Ok(response
        .messages
        .into_iter()
        .map(|m| QueueMessage {
            message_id: m.message_id,
            receipt_handle: m.receipt_handle,
            body: m.body,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_to_queue_origin() {
        let client = SqsClient::new(
            "https://sqs.eu-west-1.amazonaws.com/123456789012/card-events",
            None,
            &ReceiveOptions::default(),
        )
        .unwrap();
        assert_eq!(client.endpoint, "https://sqs.eu-west-1.amazonaws.com");
        assert_eq!(client.queue_name(), "card-events");
    }

    #[test]
    fn explicit_endpoint_wins() {
        let client = SqsClient::new(
            "http://localhost:9324/000000000000/card-events",
            Some("http://elasticmq:9324/"),
            &ReceiveOptions::default(),
        )
        .unwrap();
        assert_eq!(client.endpoint, "http://elasticmq:9324");
    }

    #[test]
    fn invalid_queue_url_is_config_error() {
        let err = SqsClient::new("not a url", None, &ReceiveOptions::default()).unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn parses_messages_and_empty_responses() {
        let value = serde_json::json!({
            "Messages": [
                {"MessageId": "m-1", "ReceiptHandle": "r-1", "Body": "{\"a\":1}", "MD5OfBody": "x"}
            ]
        });
        let messages = parse_receive_response(value).unwrap();
        assert_eq!(
            messages,
            vec![QueueMessage {
                message_id: "m-1".into(),
                receipt_handle: "r-1".into(),
                body: "{\"a\":1}".into(),
            }]
        );

        assert!(parse_receive_response(serde_json::json!({})).unwrap().is_empty());
        assert!(parse_receive_response(Value::Null).unwrap().is_empty());
    }

    #[tokio::test]
    async fn truncated_success_body_is_unreachable() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // Drain the request so closing the socket is a clean FIN.
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request.ends_with(b"}") {
                    break;
                }
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: application/x-amz-json-1.0\r\nContent-Length: 64\r\n\r\n{\"Messages\":[",
                )
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let queue_url = format!("http://{addr}/000000000000/card-events");
        let options = ReceiveOptions {
            wait: Duration::from_secs(0),
            ..ReceiveOptions::default()
        };
        let client = SqsClient::new(&queue_url, None, &options).unwrap();
        let err = client.receive(&options).await.unwrap_err();
        assert!(matches!(err, QueueError::Unreachable(_)), "{err:?}");
        assert!(err.is_transient());
    }

    #[test]
    fn unreachable_is_transient() {
        assert!(QueueError::Unreachable("timeout".into()).is_transient());
        assert!(!QueueError::InvalidResponse("bad".into()).is_transient());
    }
}
