use crate::api::pipeline::ApiClient;
use crate::auth::store::{DeviceState, SessionStore};
use crate::core::errors::ClientError;
use crate::core::types::{Credential, UserSummary};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{instrument, warn};

const LOGIN_PATH: &str = "/auth/login";
const REGISTER_PATH: &str = "/auth/register";
const LOGOUT_PATH: &str = "/auth/logout";
const REVOKE_PATH: &str = "/auth/revoke-token";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

/// Token grant shared by login, registration and refresh responses, decoded
/// at the pipeline boundary so nothing downstream handles maybe-present wire
/// fields.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    renewal_token: Option<String>,
    user: UserSummary,
    #[serde(default)]
    device: Option<DeviceGrant>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceGrant {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    trusted: bool,
    #[serde(default)]
    new_device: bool,
}

impl DeviceGrant {
    fn into_state(self, fallback_name: Option<&str>) -> DeviceState {
        DeviceState {
            device_name: self.name.or_else(|| fallback_name.map(str::to_string)),
            trusted: self.trusted,
            new_device: self.new_device,
        }
    }
}

/// An established session: the stored credential plus the signed-in user.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub credential: Credential,
    pub user: UserSummary,
    pub device: DeviceState,
}

/// Typed surface over the authentication endpoints.
///
/// These are the only calls the pipeline never silently recovers: a 401 here
/// is a rejected sign-in and surfaces as [`ClientError::AuthenticationRejected`].
pub struct AuthApi {
    api: Arc<ApiClient>,
    sessions: Arc<SessionStore>,
    default_device_name: Option<String>,
}

impl AuthApi {
    pub fn new(
        api: Arc<ApiClient>,
        sessions: Arc<SessionStore>,
        default_device_name: Option<String>,
    ) -> Self {
        Self {
            api,
            sessions,
            default_device_name,
        }
    }

    /// Exchange credentials for a token pair and persist the session.
    #[instrument(skip(self, request), fields(email = %request.email))]
    pub async fn login(&self, mut request: LoginRequest) -> Result<AuthSession, ClientError> {
        if request.device_name.is_none() {
            request.device_name = self.default_device_name.clone();
        }
        let body = serde_json::to_value(&request)
            .map_err(|e| ClientError::Credential(format!("unencodable login request: {}", e)))?;
        let grant: TokenGrant = self.api.post_json(LOGIN_PATH, body).await?;
        self.establish(grant).await
    }

    /// Create an account and persist the granted session.
    #[instrument(skip(self, request), fields(email = %request.email))]
    pub async fn register(&self, mut request: RegisterRequest) -> Result<AuthSession, ClientError> {
        if request.device_name.is_none() {
            request.device_name = self.default_device_name.clone();
        }
        let body = serde_json::to_value(&request)
            .map_err(|e| ClientError::Credential(format!("unencodable register request: {}", e)))?;
        let grant: TokenGrant = self.api.post_json(REGISTER_PATH, body).await?;
        self.establish(grant).await
    }

    /// Invalidate the server-side session, then drop all local state.
    ///
    /// The network call is best-effort: a failure must not leave the client
    /// half logged out, so local state is cleared unconditionally.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        if let Err(e) = self.api.post(LOGOUT_PATH, json!({})).await {
            warn!("logout request failed; clearing local session anyway: {}", e);
        }
        self.sessions.clear();
    }

    /// Explicitly invalidate the renewal credential, then drop local state.
    #[instrument(skip(self))]
    pub async fn revoke_token(&self) -> Result<(), ClientError> {
        let body = match self.sessions.renewal_token() {
            Some(renewal) => json!({ "renewalToken": renewal.expose_secret() }),
            // Server-mediated mode: the cookie identifies the renewal token.
            None => json!({}),
        };
        let result = self.api.post(REVOKE_PATH, body).await;
        self.sessions.clear();
        result.map(|_| ())
    }

    async fn establish(&self, grant: TokenGrant) -> Result<AuthSession, ClientError> {
        let device = grant
            .device
            .map(|d| d.into_state(self.default_device_name.as_deref()))
            .unwrap_or_else(|| DeviceState {
                device_name: self.default_device_name.clone(),
                ..DeviceState::default()
            });

        let credential = self
            .sessions
            .save(
                &grant.access_token,
                grant.renewal_token.as_deref(),
                Some(device.clone()),
            )
            .await?;

        Ok(AuthSession {
            credential,
            user: grant.user,
            device,
        })
    }
}

impl std::fmt::Debug for AuthApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthApi")
            .field("default_device_name", &self.default_device_name)
            .finish_non_exhaustive()
    }
}
