use crate::core::kernel::{HttpTransport, TransportRequest};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// Header carrying the synchronizer token on state-changing requests.
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Cookie name under which some deployments expose the token.
const CSRF_COOKIE: &str = "XSRF-TOKEN";

/// Endpoint that issues a token on demand.
const CSRF_TOKEN_PATH: &str = "/csrf-token";

/// Manages the process-wide CSRF synchronizer token.
///
/// Lazily populated; replaced wholesale when the backing service rejects it.
/// Absence of a token is tolerated: the deployment may not require CSRF
/// protection, and safe (read) requests never carry the header anyway.
pub struct CsrfManager {
    transport: Arc<dyn HttpTransport>,
    cookie_jar: Arc<Jar>,
    base_url: String,
    embedded: Option<String>,
    token: RwLock<Option<String>>,
}

impl CsrfManager {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        cookie_jar: Arc<Jar>,
        base_url: String,
        embedded: Option<String>,
    ) -> Self {
        Self {
            transport,
            cookie_jar,
            base_url,
            embedded,
            token: RwLock::new(None),
        }
    }

    /// The currently held token, if any. Does not acquire.
    pub async fn current(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Acquire a token if none is held. Idempotent; a held token is returned
    /// as-is.
    ///
    /// Acquisition order, first success wins: the embedded page-level token,
    /// a cookie-set token, an explicit fetch from the token endpoint. A failed
    /// network fetch is not an error: the application proceeds without a
    /// token.
    #[instrument(skip(self))]
    pub async fn ensure_token(&self) -> Option<String> {
        {
            let held = self.token.read().await;
            if held.is_some() {
                return held.clone();
            }
        }

        let acquired = if let Some(embedded) = &self.embedded {
            debug!("using embedded CSRF token");
            Some(embedded.clone())
        } else if let Some(cookie) = self.cookie_token() {
            debug!("using cookie-set CSRF token");
            Some(cookie)
        } else {
            self.fetch_token().await
        };

        if let Some(token) = acquired {
            let mut held = self.token.write().await;
            // A concurrent acquirer may have won; keep its token.
            if held.is_none() {
                *held = Some(token);
            }
            return held.clone();
        }
        None
    }

    /// Force a refetch from the token endpoint, replacing whatever is held.
    /// Used when the backing service rejected the current token.
    #[instrument(skip(self))]
    pub async fn refresh_token(&self) -> Option<String> {
        let fetched = self.fetch_token().await;
        let mut held = self.token.write().await;
        if let Some(token) = &fetched {
            *held = Some(token.clone());
        }
        fetched.or_else(|| held.clone())
    }

    /// Drop the held token (logout teardown).
    pub async fn clear(&self) {
        *self.token.write().await = None;
    }

    fn cookie_token(&self) -> Option<String> {
        let url = reqwest::Url::parse(&self.base_url).ok()?;
        let header = self.cookie_jar.cookies(&url)?;
        let cookies = header.to_str().ok()?;
        for pair in cookies.split(';') {
            let (name, value) = pair.trim().split_once('=')?;
            if name == CSRF_COOKIE && !value.is_empty() {
                return Some(value.to_string());
            }
        }
        None
    }

    async fn fetch_token(&self) -> Option<String> {
        let request = TransportRequest::new(Method::GET, CSRF_TOKEN_PATH);
        match self.transport.execute(request).await {
            Ok(response) if response.is_success() => {
                let body: Value = serde_json::from_str(&response.body).ok()?;
                let token = body
                    .get("csrfToken")
                    .or_else(|| body.get("CsrfToken"))
                    .and_then(Value::as_str)?;
                Some(token.to_string())
            }
            Ok(response) => {
                warn!(status = %response.status, "CSRF token endpoint returned an error; proceeding without a token");
                None
            }
            Err(e) => {
                // The deployment may not require CSRF protection; do not
                // block the application on this fetch.
                warn!("CSRF token fetch failed; proceeding without a token: {}", e);
                None
            }
        }
    }
}

impl std::fmt::Debug for CsrfManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfManager")
            .field("base_url", &self.base_url)
            .field("has_embedded", &self.embedded.is_some())
            .finish_non_exhaustive()
    }
}
