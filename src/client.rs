use crate::api::auth_api::{AuthApi, AuthSession, LoginRequest, RegisterRequest};
use crate::api::pipeline::ApiClient;
use crate::auth::csrf::CsrfManager;
use crate::auth::store::{MemoryBackend, SessionStore, StorageBackend};
use crate::channels::dispatcher::Subscription;
use crate::channels::manager::{ChannelConfig, ChannelManager};
use crate::core::config::ClientConfig;
use crate::core::errors::ClientError;
use crate::core::kernel::{HttpTransport, TransportBuilder, TransportConfig};
use crate::core::types::{Credential, Notification, SecurityEvent, SecurityEventKind};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// The application-composition root.
///
/// Owns every service explicitly (no module-level singletons): the HTTP
/// transport, the session store, the CSRF manager, the request pipeline and
/// one channel manager per concern. Call sites hold one `LumenClient` and
/// pass it by reference.
pub struct LumenClient {
    config: ClientConfig,
    sessions: Arc<SessionStore>,
    csrf: Arc<CsrfManager>,
    api: Arc<ApiClient>,
    auth: AuthApi,
    notifications: ChannelManager,
    security: ChannelManager,
}

impl LumenClient {
    /// Build a client with in-memory session storage (tab-session semantics).
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Self::with_backend(config, Arc::new(MemoryBackend::new()))
    }

    /// Build a client against a caller-provided storage backend.
    pub fn with_backend(
        config: ClientConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self, ClientError> {
        let transport_config = TransportConfig::new(config.base_url.clone(), "lumen".to_string())
            .with_timeout(config.timeout_seconds)
            .with_user_agent(config.user_agent.clone());
        let transport = TransportBuilder::new(transport_config).build()?;
        let cookie_jar = transport.cookie_jar();
        let transport: Arc<dyn HttpTransport> = Arc::new(transport);

        let sessions = Arc::new(SessionStore::new(
            backend,
            Arc::clone(&transport),
            config.credential_mode,
            config.storage_key.clone(),
        ));
        sessions.bootstrap();

        let csrf = Arc::new(CsrfManager::new(
            Arc::clone(&transport),
            cookie_jar,
            config.base_url.clone(),
            config.embedded_csrf_token.clone(),
        ));

        let api = Arc::new(ApiClient::new(
            Arc::clone(&transport),
            Arc::clone(&sessions),
            Arc::clone(&csrf),
            config.normalize_keys,
        ));

        let auth = AuthApi::new(
            Arc::clone(&api),
            Arc::clone(&sessions),
            config.device_name.clone(),
        );

        let notifications = ChannelManager::new(
            ChannelConfig::notifications(&config.ws_url).normalize_keys(config.normalize_keys),
            Arc::clone(&sessions),
        );
        let security = ChannelManager::new(
            ChannelConfig::security(&config.ws_url).normalize_keys(config.normalize_keys),
            Arc::clone(&sessions),
        );

        Ok(Self {
            config,
            sessions,
            csrf,
            api,
            auth,
            notifications,
            security,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The request pipeline, for domain calls (consultations, billing, ...).
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn notifications(&self) -> &ChannelManager {
        &self.notifications
    }

    pub fn security(&self) -> &ChannelManager {
        &self.security
    }

    /// The current credential, if a non-expired one is held.
    pub fn current_credential(&self) -> Option<Credential> {
        self.sessions.load().filter(|credential| !credential.is_expired())
    }

    /// Sign in and persist the granted session.
    pub async fn login(&self, request: LoginRequest) -> Result<AuthSession, ClientError> {
        self.auth.login(request).await
    }

    /// Create an account and persist the granted session.
    pub async fn register(&self, request: RegisterRequest) -> Result<AuthSession, ClientError> {
        self.auth.register(request).await
    }

    /// Open both real-time channels for the signed-in subject.
    pub async fn connect_channels(&self) -> Result<(), ClientError> {
        let credential = self
            .current_credential()
            .ok_or(ClientError::AuthenticationExpired)?;
        self.notifications.connect(&credential.subject).await?;
        self.security.connect(&credential.subject).await?;
        Ok(())
    }

    /// Renew the credential ahead of expiry, joining any in-flight refresh.
    pub async fn refresh_session(&self) -> Result<(), ClientError> {
        self.api.refresh_session().await
    }

    /// Explicitly invalidate the renewal credential and drop local state.
    pub async fn revoke_token(&self) -> Result<(), ClientError> {
        self.auth.revoke_token().await
    }

    /// Full teardown: channels closed (with their subscriptions released),
    /// server-side session invalidated best-effort, local state cleared.
    pub async fn logout(&self) {
        self.notifications.disconnect().await;
        self.security.disconnect().await;
        self.auth.logout().await;
        self.csrf.clear().await;
    }

    /// Register a typed handler for generic notifications.
    pub fn on_notification(
        &self,
        handler: impl Fn(Notification) + Send + Sync + 'static,
    ) -> Subscription {
        self.notifications
            .on(crate::core::types::NOTIFICATION_EVENT, move |payload| {
                match serde_json::from_value::<Notification>(payload) {
                    Ok(notification) => handler(notification),
                    Err(e) => warn!("undecodable notification payload: {}", e),
                }
            })
    }

    /// Register a typed handler across all security events.
    pub fn on_security_event(
        &self,
        handler: impl Fn(SecurityEvent) + Send + Sync + 'static,
    ) -> Vec<Subscription> {
        let handler = Arc::new(handler);
        SecurityEventKind::ALL
            .into_iter()
            .map(|kind| {
                let handler = Arc::clone(&handler);
                self.security.on(kind.event_name(), move |payload: Value| {
                    match serde_json::from_value(payload) {
                        Ok(details) => handler(SecurityEvent { kind, details }),
                        Err(e) => warn!(event = kind.event_name(), "undecodable security payload: {}", e),
                    }
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for LumenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LumenClient")
            .field("base_url", &self.config.base_url)
            .field("has_credential", &self.sessions.load().is_some())
            .finish_non_exhaustive()
    }
}
