//! Terrarium REST API Client
//!
//! HTTP client for the two read-only upstream endpoints the relay needs.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

use super::error::{UpstreamError, UpstreamResult};
use super::types::{DeviceId, DeviceReading, DeviceRef, Reading, UserRecord};
use super::DeviceSource;
use crate::relay::SessionKey;

/// Terrarium REST API client
///
/// Holds a single `reqwest::Client` so connections are kept alive across
/// ticks and sessions. No retries are done here; a failed call is reported
/// to the poller as-is.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    config: UpstreamConfig,
}

/// Configuration for the upstream client
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Root of the directory/reading API (e.g., "http://localhost:8080")
    pub base_url: String,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout_ms: 5000,
        }
    }
}

impl UpstreamClient {
    /// Create a new client with the given configuration
    pub fn new(config: UpstreamConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .expect("Failed to create HTTP client");

        Self { client, config }
    }

    /// Get the current configuration
    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Keys and ids are client or upstream supplied; each is a single path segment
    fn users_url(&self, key: &SessionKey) -> String {
        format!(
            "{}/users/{}",
            self.base_url(),
            urlencoding::encode(key.as_str())
        )
    }

    fn reading_url(&self, id: &DeviceId) -> String {
        format!(
            "{}/readings/current/reading/{}",
            self.base_url(),
            urlencoding::encode(&id.to_string())
        )
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// Fetch the device list of a user
    pub async fn fetch_devices(&self, key: &SessionKey) -> UpstreamResult<Vec<DeviceRef>> {
        let url = self.users_url(key);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Unavailable(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        let body = response.bytes().await?;
        let user: UserRecord = serde_json::from_slice(&body)?;
        Ok(user.devices.unwrap_or_default())
    }

    /// Fetch the current reading of one device
    ///
    /// "No data yet" (204, 404, an empty body or a `null` body) is reported
    /// as [`DeviceReading::Absent`], not as an error.
    pub async fn fetch_reading(&self, id: &DeviceId) -> UpstreamResult<DeviceReading> {
        let url = self.reading_url(id);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_FOUND {
            return Ok(DeviceReading::Absent);
        }
        if !status.is_success() {
            return Err(UpstreamError::Unavailable(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        let body = response.bytes().await?;
        parse_reading(&body)
    }
}

fn parse_reading(body: &[u8]) -> UpstreamResult<DeviceReading> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DeviceReading::Absent);
    }

    let value: Value = serde_json::from_slice(body)?;
    match value {
        Value::Null => Ok(DeviceReading::Absent),
        Value::Object(_) => {
            let reading: Reading = serde_json::from_value(value)?;
            Ok(DeviceReading::Present(reading))
        }
        other => Err(UpstreamError::Malformed(format!(
            "expected a reading object, got {}",
            other
        ))),
    }
}

#[async_trait]
impl DeviceSource for UpstreamClient {
    async fn fetch_devices(&self, key: &SessionKey) -> UpstreamResult<Vec<DeviceRef>> {
        UpstreamClient::fetch_devices(self, key).await
    }

    async fn fetch_reading(&self, id: &DeviceId) -> UpstreamResult<DeviceReading> {
        UpstreamClient::fetch_reading(self, id).await
    }
}
