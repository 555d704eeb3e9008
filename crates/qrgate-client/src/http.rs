//! HTTP session creation against a QRGate server

use async_trait::async_trait;
use qrgate_core::protocol::{CreateSessionRequest, CreateSessionResponse};
use qrgate_core::{Error, Result};
use tracing::debug;

use crate::transport::SessionApi;

/// Creates sessions through `POST /auth/qr/generate`
#[derive(Debug, Clone)]
pub struct HttpSessionApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSessionApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn generate_url(&self) -> String {
        format!("{}/auth/qr/generate", self.base_url)
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        let url = self.generate_url();
        debug!("Requesting QR session from {}", url);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Network(format!("issuer responded with {}", status)));
        }

        response
            .json::<CreateSessionResponse>()
            .await
            .map_err(|e| Error::Protocol(format!("invalid creation response: {}", e)))
    }
}
