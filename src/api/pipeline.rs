use crate::api::transform;
use crate::auth::csrf::{CsrfManager, CSRF_HEADER};
use crate::auth::store::SessionStore;
use crate::core::errors::ClientError;
use crate::core::kernel::{
    HttpTransport, MultipartField, MultipartValue, RequestBody, TransportRequest,
    TransportResponse,
};
use reqwest::Method;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

const REFRESH_PATH: &str = "/auth/refresh-token";

/// Structured error code the backing service attaches to CSRF rejections.
const CSRF_REJECTION_CODE: &str = "EBADCSRFTOKEN";

/// A file to send as a multipart upload.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub field_name: String,
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl FileUpload {
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            field_name: "file".to_string(),
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        }
    }
}

/// Failure envelope returned by the backing service.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEnvelope {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    errors: Option<HashMap<String, Vec<String>>>,
}

/// Token grant returned by the refresh endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshGrant {
    access_token: String,
    #[serde(default)]
    renewal_token: Option<String>,
}

/// What a single dispatch attempt resolved to, before recovery rules apply.
enum Outcome {
    Success(Value),
    /// 2xx whose body is an HTML sign-in page: the fronting proxy redirected
    /// instead of returning JSON. Handled like an expired credential.
    HtmlLoginPage,
    Unauthorized { message: String },
    CsrfRejection,
    Forbidden { message: String },
    Terminal(ClientError),
}

/// The authenticated request pipeline.
///
/// Builds each request (bearer credential, CSRF header), dispatches it, and
/// drives recovery: a 401 outside the auth endpoints triggers at most one
/// silent re-authentication, a CSRF-rejected 403 triggers at most one forced
/// token refresh, and each recovery re-issues the original request exactly
/// once. Recovery mutates the session store and the CSRF manager as a side
/// effect of otherwise "read" operations; that is intentional.
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    sessions: Arc<SessionStore>,
    csrf: Arc<CsrfManager>,
    normalize_keys: bool,
    refresh_gate: Mutex<()>,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        sessions: Arc<SessionStore>,
        csrf: Arc<CsrfManager>,
        normalize_keys: bool,
    ) -> Self {
        Self {
            transport,
            sessions,
            csrf,
            normalize_keys,
            refresh_gate: Mutex::new(()),
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value, ClientError> {
        self.execute(Method::GET, path, RequestBody::Empty).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        self.execute(Method::POST, path, RequestBody::Json(body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        self.execute(Method::PUT, path, RequestBody::Json(body)).await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        self.execute(Method::PATCH, path, RequestBody::Json(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ClientError> {
        self.execute(Method::DELETE, path, RequestBody::Empty).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        Self::decode(self.get(path).await?)
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
    ) -> Result<T, ClientError> {
        Self::decode(self.post(path, body).await?)
    }

    pub async fn put_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
    ) -> Result<T, ClientError> {
        Self::decode(self.put(path, body).await?)
    }

    pub async fn patch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
    ) -> Result<T, ClientError> {
        Self::decode(self.patch(path, body).await?)
    }

    pub async fn delete_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        Self::decode(self.delete(path).await?)
    }

    /// Upload a file with optional extra form fields.
    pub async fn upload_file(
        &self,
        path: &str,
        file: FileUpload,
        fields: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        let mut parts: Vec<MultipartField> = fields
            .iter()
            .map(|(name, value)| MultipartField {
                name: (*name).to_string(),
                value: MultipartValue::Text((*value).to_string()),
            })
            .collect();
        parts.push(MultipartField {
            name: file.field_name,
            value: MultipartValue::File {
                filename: file.filename,
                content_type: file.content_type,
                data: file.data,
            },
        });
        self.execute(Method::POST, path, RequestBody::Multipart(parts)).await
    }

    /// Force a credential refresh ahead of expiry. Joins an in-flight refresh
    /// if one is running.
    pub async fn refresh_session(&self) -> Result<(), ClientError> {
        let observed_generation = self.sessions.generation();
        self.reauthenticate(observed_generation).await
    }

    fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ClientError> {
        serde_json::from_value(value)
            .map_err(|e| ClientError::MalformedResponse(format!("failed to decode response: {}", e)))
    }

    #[instrument(skip(self, body), fields(method = %method, path = %path))]
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: RequestBody,
    ) -> Result<Value, ClientError> {
        let is_auth_endpoint = path.starts_with("/auth/");
        let safe_method = matches!(method, Method::GET | Method::HEAD | Method::OPTIONS);

        // Explicit bounded recovery: each flag permits exactly one retry, so
        // the loop terminates even under pathological server behavior.
        let mut reauthenticated = false;
        let mut csrf_refreshed = false;

        loop {
            // Generation snapshot precedes the credential read: if the
            // credential we attach turns out stale, the generation is stale
            // too, and recovery joins the refresh that replaced it.
            let observed_generation = self.sessions.generation();
            let request = self
                .build_request(method.clone(), path, &body, safe_method)
                .await;
            let response = self.transport.execute(request).await?;

            match self.classify(response) {
                Outcome::Success(value) => return Ok(value),
                Outcome::Unauthorized { message } if is_auth_endpoint => {
                    // Login/register/refresh failing with 401 is a rejected
                    // sign-in, not a recoverable condition.
                    return Err(ClientError::AuthenticationRejected(message));
                }
                Outcome::HtmlLoginPage if is_auth_endpoint => {
                    return Err(ClientError::AuthenticationRejected(
                        "authentication required".to_string(),
                    ));
                }
                Outcome::Unauthorized { .. } | Outcome::HtmlLoginPage => {
                    if reauthenticated {
                        return Err(ClientError::AuthenticationExpired);
                    }
                    reauthenticated = true;
                    self.reauthenticate(observed_generation).await?;
                    debug!("credential refreshed; re-issuing original request");
                }
                Outcome::CsrfRejection => {
                    if safe_method || csrf_refreshed {
                        return Err(ClientError::CsrfRejected);
                    }
                    csrf_refreshed = true;
                    if self.csrf.refresh_token().await.is_none() {
                        return Err(ClientError::CsrfRejected);
                    }
                    debug!("CSRF token refreshed; re-issuing original request");
                }
                Outcome::Forbidden { message } => {
                    // Retrying cannot fix an authorization failure.
                    return Err(ClientError::AccessDenied(message));
                }
                Outcome::Terminal(error) => return Err(error),
            }
        }
    }

    /// Build one dispatch attempt. The credential is read fresh from the
    /// store on every attempt: a refresh may have replaced it between tries.
    async fn build_request(
        &self,
        method: Method,
        path: &str,
        body: &RequestBody,
        safe_method: bool,
    ) -> TransportRequest {
        let mut request = TransportRequest::new(method, path);
        request.body = body.clone();

        if matches!(body, RequestBody::Json(_)) {
            request = request.header("Accept", "application/json");
        }
        if let Some(token) = self.sessions.access_token() {
            request = request.header(
                "Authorization",
                format!("Bearer {}", token.expose_secret()),
            );
        }
        if !safe_method {
            if let Some(token) = self.csrf.ensure_token().await {
                request = request.header(CSRF_HEADER, token);
            }
        }
        request
    }

    fn classify(&self, response: TransportResponse) -> Outcome {
        let status = response.status;

        if status.is_success() {
            let trimmed = response.body.trim();
            if trimmed.is_empty() {
                // Uniform destructuring for callers: empty body becomes an
                // empty object, never null.
                return Outcome::Success(Value::Object(Map::new()));
            }
            return match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => {
                    let value = if self.normalize_keys {
                        transform::normalize(value)
                    } else {
                        value
                    };
                    Outcome::Success(value)
                }
                Err(_) if looks_like_html(trimmed) => Outcome::HtmlLoginPage,
                Err(e) => Outcome::Terminal(ClientError::MalformedResponse(format!(
                    "expected JSON response: {}",
                    e
                ))),
            };
        }

        let envelope = parse_error_envelope(&response.body);
        let message = envelope
            .message
            .clone()
            .unwrap_or_else(|| fallback_message(&response.body, status.as_u16()));

        match status.as_u16() {
            401 => Outcome::Unauthorized { message },
            403 if is_csrf_rejection(&envelope) => Outcome::CsrfRejection,
            403 => Outcome::Forbidden { message },
            _ => {
                if let Some(errors) = envelope.errors.filter(|errors| !errors.is_empty()) {
                    Outcome::Terminal(ClientError::ValidationFailed {
                        status: status.as_u16(),
                        message,
                        errors,
                    })
                } else {
                    Outcome::Terminal(ClientError::Api {
                        status: status.as_u16(),
                        message,
                    })
                }
            }
        }
    }

    /// Exchange the renewal credential for a fresh token pair, single-flight.
    ///
    /// Concurrent 401s race to this gate; whoever wins performs the refresh,
    /// and the rest observe the bumped store generation and join its outcome
    /// instead of starting a duplicate (duplicate refreshes can invalidate
    /// each other's renewal credential).
    async fn reauthenticate(&self, observed_generation: u64) -> Result<(), ClientError> {
        let _guard = self.refresh_gate.lock().await;

        if self.sessions.generation() != observed_generation {
            return match self.sessions.load() {
                Some(credential) if !credential.is_expired() => Ok(()),
                _ => Err(ClientError::AuthenticationExpired),
            };
        }

        let renewal = self.sessions.renewal_token();
        let mut request = TransportRequest::new(Method::POST, REFRESH_PATH);
        if let Some(renewal) = &renewal {
            // Local mode sends the renewal credential in the body; in
            // server-mediated mode it rides in as a cookie.
            request = request.json(serde_json::json!({
                "renewalToken": renewal.expose_secret(),
            }));
        }
        if let Some(token) = self.csrf.current().await {
            request = request.header(CSRF_HEADER, token);
        }

        // A transport-level failure is a connectivity problem, not a rejected
        // renewal: propagate it without destroying the session.
        let response = self.transport.execute(request).await?;

        if response.is_success() {
            let value: Value = serde_json::from_str(&response.body).map_err(|e| {
                ClientError::MalformedResponse(format!("refresh response was not JSON: {}", e))
            })?;
            let grant: RefreshGrant = serde_json::from_value(transform::normalize(value))
                .map_err(|e| {
                    ClientError::MalformedResponse(format!("refresh grant undecodable: {}", e))
                })?;
            self.sessions
                .save(&grant.access_token, grant.renewal_token.as_deref(), None)
                .await?;
            debug!("silent re-authentication succeeded");
            Ok(())
        } else {
            warn!(status = %response.status, "silent re-authentication rejected; clearing session");
            self.sessions.clear();
            Err(ClientError::AuthenticationExpired)
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("normalize_keys", &self.normalize_keys)
            .finish_non_exhaustive()
    }
}

fn looks_like_html(body: &str) -> bool {
    let head = body.trim_start().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Parse the failure envelope. Field casing on the wire is capitalized, so
/// the body is normalized before decoding; normalization is idempotent, so
/// already-camel deployments parse identically.
fn parse_error_envelope(body: &str) -> ErrorEnvelope {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| serde_json::from_value(transform::normalize(value)).ok())
        .unwrap_or_default()
}

/// A 403 counts as a CSRF rejection when the envelope carries the structured
/// code; the message-substring check covers deployments that predate it.
fn is_csrf_rejection(envelope: &ErrorEnvelope) -> bool {
    if envelope.code.as_deref() == Some(CSRF_REJECTION_CODE) {
        return true;
    }
    envelope
        .message
        .as_deref()
        .is_some_and(|message| message.to_ascii_lowercase().contains("csrf"))
}

fn fallback_message(body: &str, status: u16) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("request failed with status {}", status)
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_bodies_are_detected_case_insensitively() {
        assert!(looks_like_html("<!DOCTYPE html><html><body>Sign in</body></html>"));
        assert!(looks_like_html("  <html lang=\"en\"><head></head></html>"));
        assert!(!looks_like_html("{\"Message\":\"ok\"}"));
        assert!(!looks_like_html("plain text"));
    }

    #[test]
    fn error_envelope_parses_capitalized_wire_fields() {
        let envelope = parse_error_envelope(
            "{\"Message\":\"No good\",\"Errors\":{\"Email\":[\"required\"]}}",
        );
        assert_eq!(envelope.message.as_deref(), Some("No good"));
        let errors = envelope.errors.unwrap();
        assert_eq!(errors["email"], vec!["required".to_string()]);
    }

    #[test]
    fn error_envelope_tolerates_garbage() {
        let envelope = parse_error_envelope("not json at all");
        assert!(envelope.message.is_none());
        assert!(envelope.errors.is_none());
    }

    #[test]
    fn csrf_rejection_prefers_structured_code() {
        let by_code = ErrorEnvelope {
            message: Some("forbidden".to_string()),
            code: Some("EBADCSRFTOKEN".to_string()),
            errors: None,
        };
        assert!(is_csrf_rejection(&by_code));

        let by_message = ErrorEnvelope {
            message: Some("Invalid CSRF token".to_string()),
            code: None,
            errors: None,
        };
        assert!(is_csrf_rejection(&by_message));

        let plain_denial = ErrorEnvelope {
            message: Some("You do not have access to this resource".to_string()),
            code: None,
            errors: None,
        };
        assert!(!is_csrf_rejection(&plain_denial));
    }
}
