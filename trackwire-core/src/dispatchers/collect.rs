//! HTTP collect dispatcher
//!
//! Single events go to `collect.url` as a JSON POST (or a GET with the
//! payload in the query string). Batches are compacted, gzip-compressed and
//! posted to `collect.bulk_url`:
//!
//! ```json
//! { "shared": { "app_name": "demo" }, "events": [ { "event_name": "a" }, ... ] }
//! ```
//!
//! Keys whose value is identical in every event of the batch move to `shared`.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio::runtime::Handle;

use crate::config::{CollectConfig, CollectMethod};
use crate::error::{DispatchError, Error, Result};
use crate::modules::{Dispatcher, ModuleCompletion, ModuleDelegate};
use crate::types::{DispatchRequest, ModuleResponse, Payload};

/// Module id of the collect dispatcher
pub const MODULE_ID: &str = "collect";

/// HTTP client for the collect endpoints
pub struct CollectClient {
    http_client: reqwest::Client,
    url: String,
    bulk_url: String,
    method: CollectMethod,
}

impl CollectClient {
    /// Create a client from configuration
    ///
    /// Returns an error if no endpoint is configured.
    pub fn new(config: &CollectConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| Error::Config("collect.url is required".to_string()))?;
        let bulk_url = config.bulk_endpoint().unwrap_or(&url).to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url,
            bulk_url,
            method: config.method,
        })
    }

    /// Send one event
    pub async fn send_single(&self, payload: &Payload) -> std::result::Result<Payload, DispatchError> {
        let request = match self.method {
            CollectMethod::Post => self.http_client.post(&self.url).json(payload),
            CollectMethod::Get => self.http_client.get(query_url(&self.url, payload)),
        };
        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::Network(format!("HTTP request failed: {}", e)))?;
        check_response(response).await
    }

    /// Send an already compressed bulk body
    pub async fn send_bulk(&self, body: Vec<u8>) -> std::result::Result<Payload, DispatchError> {
        let response = self
            .http_client
            .post(&self.bulk_url)
            .header(CONTENT_ENCODING, "gzip")
            .body(body)
            .send()
            .await
            .map_err(|e| DispatchError::Network(format!("HTTP request failed: {}", e)))?;
        check_response(response).await
    }
}

async fn check_response(response: reqwest::Response) -> std::result::Result<Payload, DispatchError> {
    let status = response.status();
    if status.is_success() {
        let mut info = Payload::new();
        info.insert("status".to_string(), json!(status.as_u16()));
        Ok(info)
    } else {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());
        Err(DispatchError::Network(format!(
            "collect endpoint error ({}): {}",
            status, error_text
        )))
    }
}

/// Append the payload to `base` as query parameters
fn query_url(base: &str, payload: &Payload) -> String {
    let query: Vec<String> = payload
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(&value)
            )
        })
        .collect();

    if query.is_empty() {
        return base.to_string();
    }
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}", base, separator, query.join("&"))
}

/// Split a batch into keys shared by every event and per-event remainders
pub fn compact_batch(payloads: &[&Payload]) -> Value {
    let mut shared = Payload::new();
    if let Some((first, rest)) = payloads.split_first() {
        if !rest.is_empty() {
            for (key, value) in first.iter() {
                if rest.iter().all(|p| p.get(key) == Some(value)) {
                    shared.insert(key.clone(), value.clone());
                }
            }
        }
    }

    let events: Vec<Value> = payloads
        .iter()
        .map(|payload| {
            Value::Object(
                payload
                    .iter()
                    .filter(|(key, _)| !shared.contains_key(*key))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            )
        })
        .collect();

    json!({ "shared": shared, "events": events })
}

/// Compact, encode and gzip a batch
pub fn encode_bulk(payloads: &[&Payload]) -> std::result::Result<Vec<u8>, DispatchError> {
    encode_bulk_into(payloads, Vec::new())
}

/// Compact and encode a batch, gzipping it into `sink`
pub fn encode_bulk_into<W: Write>(
    payloads: &[&Payload],
    sink: W,
) -> std::result::Result<W, DispatchError> {
    let body = serde_json::to_vec(&compact_batch(payloads))
        .map_err(|e| DispatchError::Serialization(format!("failed to encode batch: {}", e)))?;

    let mut encoder = GzEncoder::new(sink, Compression::default());
    encoder
        .write_all(&body)
        .map_err(|e| DispatchError::Serialization(format!("failed to compress batch: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| DispatchError::Serialization(format!("failed to compress batch: {}", e)))
}

type BulkEncoder = fn(&[&Payload]) -> std::result::Result<Vec<u8>, DispatchError>;

/// Dispatcher that posts events to the collect endpoints
pub struct CollectDispatcher {
    client: Arc<CollectClient>,
    handle: Handle,
    delegate: Option<Arc<dyn ModuleDelegate>>,
    encode: BulkEncoder,
}

impl CollectDispatcher {
    /// Requests are sent as tasks on `handle`
    pub fn new(config: &CollectConfig, handle: Handle) -> Result<Self> {
        Ok(Self {
            client: Arc::new(CollectClient::new(config)?),
            handle,
            delegate: None,
            encode: encode_bulk,
        })
    }

    /// Channel for reporting batches that could not be encoded
    pub fn with_delegate(mut self, delegate: Arc<dyn ModuleDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }
}

impl Dispatcher for CollectDispatcher {
    fn id(&self) -> &str {
        MODULE_ID
    }

    fn dynamic_track(&self, request: DispatchRequest, completion: ModuleCompletion) {
        let client = Arc::clone(&self.client);

        match request {
            DispatchRequest::Track(request) => {
                self.handle.spawn(async move {
                    let response = match client.send_single(&request.payload).await {
                        Ok(info) => ModuleResponse::success(MODULE_ID, Some(info)),
                        Err(e) => {
                            tracing::warn!(error = %e, "Collect dispatch failed");
                            ModuleResponse::failure(MODULE_ID, e)
                        }
                    };
                    completion(response);
                });
            }
            DispatchRequest::Batch(batch) => {
                let events = batch.len();
                let body = match (self.encode)(&batch.payloads()) {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::error!(events, error = %e, "Dropping batch that could not be encoded");
                        if let Some(delegate) = &self.delegate {
                            delegate.report_error(&e.to_string());
                        }
                        completion(ModuleResponse::failure(MODULE_ID, e));
                        return;
                    }
                };

                self.handle.spawn(async move {
                    let response = match client.send_bulk(body).await {
                        Ok(info) => {
                            tracing::debug!(events, "Sent bulk batch");
                            ModuleResponse::success(MODULE_ID, Some(info))
                        }
                        Err(e) => {
                            tracing::warn!(events, error = %e, "Collect bulk dispatch failed");
                            ModuleResponse::failure(MODULE_ID, e)
                        }
                    };
                    completion(response);
                });
            }
        }
    }
}
