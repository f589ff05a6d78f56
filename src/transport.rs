// HTTP transport seam for upstream API clients.
// Clients depend on the narrow `HttpTransport` capability so tests can swap in a double.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Request;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Initialization error: {0}")]
    Init(String),
}

// Status and fully read body of an upstream response
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    async fn execute(&self, request: Request) -> Result<TransportResponse, TransportError>;
}

// Production transport backed by a pooled reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Init(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    fn map_error(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout.as_millis() as u64)
        } else {
            TransportError::Network(error.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: Request) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                self.map_error(e)
            } else {
                TransportError::Body(e.to_string())
            }
        })?;

        Ok(TransportResponse { status, body })
    }
}
