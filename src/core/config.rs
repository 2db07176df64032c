use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;

/// How the renewal credential is persisted between page loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMode {
    /// The renewal credential lives in a non-script-readable cookie set by the
    /// backing service. The only security-meaningful option.
    ServerMediated,
    /// Both credentials are obfuscated with the deployment key and kept in
    /// session-scoped storage. Development-only; the obfuscation is reversible
    /// by anyone holding the client-visible key.
    Local,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub ws_url: String,
    pub credential_mode: CredentialMode,
    pub storage_key: Secret<String>,
    /// Re-key capitalized wire fields to lowercase-leading names on every
    /// parsed response body. Disable for deployments that already serve
    /// camel-cased JSON.
    pub normalize_keys: bool,
    /// CSRF token embedded at page/process start, if the deployment provides
    /// one. Checked before the cookie and the token endpoint.
    pub embedded_csrf_token: Option<String>,
    pub device_name: Option<String>,
    pub timeout_seconds: u64,
    pub user_agent: String,
}

// Custom Serialize implementation - never expose the storage key in serialization
impl Serialize for ClientConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ClientConfig", 9)?;
        state.serialize_field("base_url", &self.base_url)?;
        state.serialize_field("ws_url", &self.ws_url)?;
        state.serialize_field("credential_mode", &self.credential_mode)?;
        state.serialize_field("storage_key", "[REDACTED]")?;
        state.serialize_field("normalize_keys", &self.normalize_keys)?;
        state.serialize_field("embedded_csrf_token", &self.embedded_csrf_token)?;
        state.serialize_field("device_name", &self.device_name)?;
        state.serialize_field("timeout_seconds", &self.timeout_seconds)?;
        state.serialize_field("user_agent", &self.user_agent)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ClientConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ClientConfigHelper {
            base_url: String,
            ws_url: Option<String>,
            credential_mode: Option<CredentialMode>,
            storage_key: String,
            normalize_keys: Option<bool>,
            embedded_csrf_token: Option<String>,
            device_name: Option<String>,
            timeout_seconds: Option<u64>,
            user_agent: Option<String>,
        }

        let helper = ClientConfigHelper::deserialize(deserializer)?;
        let mut config = Self::new(helper.base_url, helper.storage_key);
        if let Some(ws_url) = helper.ws_url {
            config.ws_url = ws_url;
        }
        if let Some(mode) = helper.credential_mode {
            config.credential_mode = mode;
        }
        if let Some(normalize) = helper.normalize_keys {
            config.normalize_keys = normalize;
        }
        config.embedded_csrf_token = helper.embedded_csrf_token;
        config.device_name = helper.device_name;
        if let Some(timeout) = helper.timeout_seconds {
            config.timeout_seconds = timeout;
        }
        if let Some(user_agent) = helper.user_agent {
            config.user_agent = user_agent;
        }
        Ok(config)
    }
}

impl ClientConfig {
    /// Create a new configuration for the given deployment.
    #[must_use]
    pub fn new(base_url: impl Into<String>, storage_key: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let ws_url = derive_ws_url(&base_url);
        Self {
            base_url,
            ws_url,
            credential_mode: CredentialMode::ServerMediated,
            storage_key: Secret::new(storage_key.into()),
            normalize_keys: true,
            embedded_csrf_token: None,
            device_name: None,
            timeout_seconds: 30,
            user_agent: format!("lumenx/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Expected environment variables:
    /// - `LUMEN_BASE_URL`
    /// - `LUMEN_STORAGE_SECRET`
    /// - `LUMEN_WS_URL` (optional, derived from the base URL otherwise)
    /// - `LUMEN_CREDENTIAL_MODE` (optional, `server` or `local`)
    /// - `LUMEN_DEVICE_NAME` (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = env::var("LUMEN_BASE_URL")
            .map_err(|_| ConfigError::MissingEnvironmentVariable("LUMEN_BASE_URL".to_string()))?;
        let storage_key = env::var("LUMEN_STORAGE_SECRET").map_err(|_| {
            ConfigError::MissingEnvironmentVariable("LUMEN_STORAGE_SECRET".to_string())
        })?;

        let mut config = Self::new(base_url, storage_key);

        if let Ok(ws_url) = env::var("LUMEN_WS_URL") {
            config.ws_url = ws_url;
        }
        if let Ok(mode) = env::var("LUMEN_CREDENTIAL_MODE") {
            config.credential_mode = match mode.to_lowercase().as_str() {
                "server" | "server-mediated" => CredentialMode::ServerMediated,
                "local" => CredentialMode::Local,
                other => {
                    return Err(ConfigError::InvalidConfiguration(format!(
                        "unknown credential mode '{}' (expected 'server' or 'local')",
                        other
                    )))
                }
            };
        }
        config.device_name = env::var("LUMEN_DEVICE_NAME").ok();

        Ok(config)
    }

    /// Create configuration from a .env file and environment variables.
    ///
    /// Loads `.env` from the working directory first (if it exists), then reads
    /// the standard `LUMEN_*` variables.
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file() -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(".env")
    }

    /// Create configuration from a specific .env file path.
    ///
    /// Useful for different environments (e.g., .env.development, .env.production).
    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // Missing file is fine; fall through to the process environment.
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env()
    }

    /// Set the WebSocket base URL.
    #[must_use]
    pub fn ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into();
        self
    }

    /// Set the credential persistence mode.
    #[must_use]
    pub const fn credential_mode(mut self, mode: CredentialMode) -> Self {
        self.credential_mode = mode;
        self
    }

    /// Enable or disable wire-field case normalization.
    #[must_use]
    pub const fn normalize_keys(mut self, normalize: bool) -> Self {
        self.normalize_keys = normalize;
        self
    }

    /// Provide a page-embedded CSRF token.
    #[must_use]
    pub fn embedded_csrf_token(mut self, token: impl Into<String>) -> Self {
        self.embedded_csrf_token = Some(token.into());
        self
    }

    /// Set the device name reported on login.
    #[must_use]
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Get the storage obfuscation key (use carefully - exposes secret).
    pub fn storage_key(&self) -> &str {
        self.storage_key.expose_secret()
    }
}

/// Derive a WebSocket base URL from an HTTP base URL.
fn derive_ws_url(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
