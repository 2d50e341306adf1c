//! Outbound notifier transport
//!
//! The dispatcher only needs "POST this JSON to that URL and tell me the
//! status". Keeping it behind a trait lets tests swap in [`mock::MockTransport`].

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Delivery timed out")]
    Timeout,

    #[error("Client setup failed: {0}")]
    Setup(String),
}

/// POST-JSON capability
#[async_trait]
pub trait NotifierTransport: Send + Sync {
    /// Send `body` to `url`, returning the HTTP status
    async fn post_json(&self, url: &str, body: &Value) -> Result<u16, TransportError>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Setup(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotifierTransport for HttpTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<u16, TransportError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;
        Ok(response.status().as_u16())
    }
}

/// Recording transport for tests
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockTransport {
        /// Every (url, body) posted, in order
        calls: Mutex<Vec<(String, Value)>>,
        /// Status returned per url; 200 when absent
        statuses: Mutex<HashMap<String, u16>>,
        /// Urls that fail with a network error
        unreachable: Mutex<Vec<String>>,
        /// Artificial latency per call
        delay: Mutex<Option<Duration>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_status(&self, url: &str, status: u16) {
            self.statuses
                .lock()
                .unwrap()
                .insert(url.to_string(), status);
        }

        pub fn set_unreachable(&self, url: &str) {
            self.unreachable.lock().unwrap().push(url.to_string());
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_to(&self, url: &str) -> Vec<Value> {
            self.calls()
                .into_iter()
                .filter(|(u, _)| u == url)
                .map(|(_, body)| body)
                .collect()
        }
    }

    #[async_trait]
    impl NotifierTransport for MockTransport {
        async fn post_json(&self, url: &str, body: &Value) -> Result<u16, TransportError> {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            self.calls
                .lock()
                .unwrap()
                .push((url.to_string(), body.clone()));

            if self.unreachable.lock().unwrap().iter().any(|u| u == url) {
                return Err(TransportError::Network("connection refused".to_string()));
            }
            Ok(self.statuses.lock().unwrap().get(url).copied().unwrap_or(200))
        }
    }
}
