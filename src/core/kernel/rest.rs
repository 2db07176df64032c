use crate::core::errors::ClientError;
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tracing::{instrument, trace};

/// Request body accepted by the transport.
///
/// Multipart content is modeled as data rather than as a `reqwest` form so
/// that the request can be rebuilt on a recovery retry and so that test
/// doubles can inspect it.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(Vec<MultipartField>),
}

#[derive(Debug, Clone)]
pub struct MultipartField {
    pub name: String,
    pub value: MultipartValue,
}

#[derive(Debug, Clone)]
pub enum MultipartValue {
    Text(String),
    File {
        filename: String,
        content_type: String,
        data: Vec<u8>,
    },
}

/// A single HTTP request, fully described. Headers carry whatever the caller
/// attached (bearer credential, CSRF token); the transport adds nothing but
/// content framing.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    #[must_use]
    pub fn multipart(mut self, fields: Vec<MultipartField>) -> Self {
        self.body = RequestBody::Multipart(fields);
        self
    }
}

/// The raw response: status plus body text. Classification (success, error
/// envelope, recovery triggers) happens in the request pipeline.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Low-level HTTP execution, behind a trait so the pipeline, the session
/// store and the CSRF manager can be tested against doubles.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, ClientError>;
}

/// Configuration for the HTTP transport.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Base URL for the API
    pub base_url: String,
    /// Service name for logging and tracing
    pub service_name: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// User agent string to include in requests
    pub user_agent: String,
}

impl TransportConfig {
    pub fn new(base_url: String, service_name: String) -> Self {
        Self {
            base_url,
            service_name,
            timeout_seconds: 30,
            user_agent: format!("lumenx/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Builder for the reqwest-backed transport.
pub struct TransportBuilder {
    config: TransportConfig,
    cookie_jar: Option<Arc<Jar>>,
}

impl TransportBuilder {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            cookie_jar: None,
        }
    }

    /// Share a cookie jar with the transport. The jar carries the
    /// server-mediated renewal cookie and any cookie-set CSRF token.
    pub fn with_cookie_jar(mut self, jar: Arc<Jar>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    pub fn build(self) -> Result<ReqwestTransport, ClientError> {
        let jar = self.cookie_jar.unwrap_or_default();
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(self.config.timeout_seconds))
            .user_agent(&self.config.user_agent)
            .cookie_provider(Arc::clone(&jar))
            .build()
            .map_err(|e| ClientError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(ReqwestTransport {
            client,
            config: self.config,
            cookie_jar: jar,
        })
    }
}

/// Implementation of [`HttpTransport`] using reqwest.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    config: TransportConfig,
    cookie_jar: Arc<Jar>,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    pub fn new(base_url: String, service_name: String) -> Result<Self, ClientError> {
        TransportBuilder::new(TransportConfig::new(base_url, service_name)).build()
    }

    /// The cookie jar shared with the underlying client.
    pub fn cookie_jar(&self) -> Arc<Jar> {
        Arc::clone(&self.cookie_jar)
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn build_multipart(fields: &[MultipartField]) -> Result<reqwest::multipart::Form, ClientError> {
        let mut form = reqwest::multipart::Form::new();
        for field in fields {
            form = match &field.value {
                MultipartValue::Text(text) => form.text(field.name.clone(), text.clone()),
                MultipartValue::File {
                    filename,
                    content_type,
                    data,
                } => {
                    let part = reqwest::multipart::Part::bytes(data.clone())
                        .file_name(filename.clone())
                        .mime_str(content_type)
                        .map_err(|e| {
                            ClientError::MalformedResponse(format!(
                                "invalid upload content type '{}': {}",
                                content_type, e
                            ))
                        })?;
                    form.part(field.name.clone(), part)
                }
            };
        }
        Ok(form)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(
        skip(self, request),
        fields(service = %self.config.service_name, method = %request.method, path = %request.path)
    )]
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, ClientError> {
        let url = self.build_url(&request.path);
        let mut builder = self.client.request(request.method.clone(), &url);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(fields) => builder.multipart(Self::build_multipart(fields)?),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::Network(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ClientError::Network(format!("failed to read response body: {}", e)))?;

        trace!(status = %status, "response received");

        Ok(TransportResponse { status, body })
    }
}
