use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use labelaudio_core::adapter::{
    CapabilityRequest, CapabilityResponse, CapabilityTransport, TransportFailure,
};
use labelaudio_core::capability::{CapabilityDescriptor, Endpoint, TransportHandle};

use crate::preview_body;

/// Provider reachable over HTTP.
///
/// `GET {base_url}/capabilities` lists descriptors;
/// `POST {base_url}/invoke` takes a capability request and answers with a
/// capability response.
pub struct HttpTransport {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    request_timeout: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DiscoveryBody {
    Wrapped { capabilities: Vec<CapabilityDescriptor> },
    Bare(Vec<CapabilityDescriptor>),
}

impl HttpTransport {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, TransportFailure> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportFailure::Connection(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            client,
            request_timeout,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> Result<HeaderMap, TransportFailure> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value = format!("Bearer {}", key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&value)
                    .map_err(|e| TransportFailure::Protocol(e.to_string()))?,
            );
        }
        Ok(headers)
    }

    fn classify_send_error(&self, err: reqwest::Error) -> TransportFailure {
        if err.is_timeout() {
            TransportFailure::Timeout(self.request_timeout)
        } else {
            TransportFailure::Connection(err.to_string())
        }
    }

    fn stamp(&self, mut descriptor: CapabilityDescriptor) -> CapabilityDescriptor {
        descriptor.transport = TransportHandle::new(
            self.name.clone(),
            Endpoint::Http {
                base_url: self.base_url.clone(),
            },
        );
        descriptor
    }
}

/// Interpret an `/invoke` answer. 429 and 5xx mean "try later"; any other
/// status must still carry a well-formed capability response.
pub(crate) fn interpret_invoke(status: StatusCode, body: &str) -> Result<CapabilityResponse, TransportFailure> {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(TransportFailure::Unavailable {
            status: status.as_u16(),
            message: preview_body(body),
        });
    }
    match serde_json::from_str::<CapabilityResponse>(body) {
        Ok(response) if response.success || response.error.is_some() => Ok(response),
        Ok(_) => Err(TransportFailure::Protocol(format!(
            "HTTP {}: failed response without error body",
            status
        ))),
        Err(e) => Err(TransportFailure::Protocol(format!(
            "HTTP {}: invalid capability response ({}): {}",
            status,
            e,
            preview_body(body)
        ))),
    }
}

pub(crate) fn parse_discovery(body: &str) -> Result<Vec<CapabilityDescriptor>, TransportFailure> {
    match serde_json::from_str::<DiscoveryBody>(body) {
        Ok(DiscoveryBody::Wrapped { capabilities }) | Ok(DiscoveryBody::Bare(capabilities)) => {
            Ok(capabilities)
        }
        Err(e) => Err(TransportFailure::Protocol(format!(
            "invalid capability listing ({}): {}",
            e,
            preview_body(body)
        ))),
    }
}

#[async_trait]
impl CapabilityTransport for HttpTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<CapabilityDescriptor>, TransportFailure> {
        let url = format!("{}/capabilities", self.base_url);
        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.classify_send_error(e))?;
        if !status.is_success() {
            return Err(TransportFailure::Unavailable {
                status: status.as_u16(),
                message: preview_body(&body),
            });
        }
        let descriptors: Vec<CapabilityDescriptor> = parse_discovery(&body)?
            .into_iter()
            .map(|d| self.stamp(d))
            .collect();
        tracing::info!(
            provider = %self.name,
            base_url = %self.base_url,
            capabilities = descriptors.len(),
            "http provider discovered"
        );
        Ok(descriptors)
    }

    async fn call(
        &self,
        descriptor: &CapabilityDescriptor,
        request: CapabilityRequest,
    ) -> Result<CapabilityResponse, TransportFailure> {
        let url = format!("{}/invoke", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&request);
        if let Some(ms) = descriptor.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.classify_send_error(e))?;
        tracing::debug!(
            provider = %self.name,
            capability = %descriptor.name,
            status = status.as_u16(),
            bytes = body.len(),
            "http invoke answered"
        );
        interpret_invoke(status, &body)
    }
}
