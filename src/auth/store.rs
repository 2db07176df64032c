use crate::auth::claims;
use crate::core::config::CredentialMode;
use crate::core::errors::ClientError;
use crate::core::kernel::{HttpTransport, TransportRequest};
use crate::core::types::{Credential, StoredSession};
use base64::engine::general_purpose;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Method;
use secrecy::{ExposeSecret, Secret};
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, instrument, warn};
use zeroize::Zeroize;

/// Storage key under which the session blob is persisted.
const SESSION_KEY: &str = "lumen.session";

/// Endpoint that persists the renewal credential as a non-script-readable
/// cookie in server-mediated mode.
const RENEWAL_COOKIE_PATH: &str = "/auth/renewal-cookie";

/// Session-scoped key/value storage.
///
/// The deployment environment decides what backs this: the in-memory backend
/// matches tab-session semantics (cleared when the process ends), and test
/// doubles can observe writes.
pub trait StorageBackend: Send + Sync {
    fn read(&self, key: &str) -> Option<String>;
    fn write(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory storage, cleared when the process exits.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn write(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

/// XOR the buffer against an HMAC-SHA256 keystream derived from the
/// deployment key. Reversible by construction; this is obfuscation, not
/// encryption, and the server-mediated cookie mode is the only
/// security-meaningful storage option.
fn apply_keystream(data: &mut [u8], key: &str) {
    for (block_index, chunk) in data.chunks_mut(32).enumerate() {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(hex::encode(u64::try_from(block_index).unwrap_or(0).to_be_bytes()).as_bytes());
        mac.update(b"lumen.session.v1");
        let block = mac.finalize().into_bytes();
        for (byte, key_byte) in chunk.iter_mut().zip(block.iter()) {
            *byte ^= key_byte;
        }
    }
}

fn obfuscate(plain: &str, key: &str) -> String {
    let mut buffer = plain.as_bytes().to_vec();
    apply_keystream(&mut buffer, key);
    let encoded = general_purpose::STANDARD.encode(&buffer);
    buffer.zeroize();
    encoded
}

fn deobfuscate(stored: &str, key: &str) -> Option<String> {
    let mut buffer = general_purpose::STANDARD.decode(stored).ok()?;
    apply_keystream(&mut buffer, key);
    let plain = String::from_utf8(buffer.clone()).ok();
    buffer.zeroize();
    plain
}

/// Device metadata attached to the persisted session.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub device_name: Option<String>,
    pub trusted: bool,
    pub new_device: bool,
}

/// Single source of truth for the current credential.
///
/// Both the request pipeline and the channel manager read it fresh at the
/// moment of use; a refresh atomically replaces the whole credential and bumps
/// the generation counter so concurrent recoveries can tell whether someone
/// else already refreshed.
pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
    transport: Arc<dyn HttpTransport>,
    storage_key: Secret<String>,
    configured_mode: CredentialMode,
    effective_mode: RwLock<CredentialMode>,
    current: RwLock<Option<Credential>>,
    device: RwLock<DeviceState>,
    generation: AtomicU64,
}

impl SessionStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        transport: Arc<dyn HttpTransport>,
        mode: CredentialMode,
        storage_key: Secret<String>,
    ) -> Self {
        Self {
            backend,
            transport,
            storage_key,
            configured_mode: mode,
            effective_mode: RwLock::new(mode),
            current: RwLock::new(None),
            device: RwLock::new(DeviceState::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Restore a persisted session, if one survives from a previous page load.
    ///
    /// A blob that fails deobfuscation or claims decoding is discarded: a
    /// corrupt session must force re-authentication, not be trusted.
    pub fn bootstrap(&self) {
        let Some(stored) = self.backend.read(SESSION_KEY) else {
            return;
        };
        let Some(plain) = deobfuscate(&stored, self.storage_key.expose_secret()) else {
            warn!("persisted session failed deobfuscation; clearing");
            self.clear();
            return;
        };
        let session: StoredSession = match serde_json::from_str(&plain) {
            Ok(session) => session,
            Err(e) => {
                warn!("persisted session failed to parse; clearing: {}", e);
                self.clear();
                return;
            }
        };

        match self.credential_from_parts(&session.access_token, session.renewal_token.as_deref()) {
            Ok(credential) => {
                if let Ok(mut device) = self.device.write() {
                    *device = DeviceState {
                        device_name: session.device_name.clone(),
                        trusted: session.trusted,
                        new_device: session.new_device,
                    };
                }
                if let Ok(mut current) = self.current.write() {
                    *current = Some(credential);
                }
                self.generation.fetch_add(1, Ordering::SeqCst);
                debug!("session restored from storage");
            }
            Err(e) => {
                warn!("persisted credential undecodable; clearing: {}", e);
                self.clear();
            }
        }
    }

    /// Persist a fresh credential pair, replacing the current one atomically.
    ///
    /// In server-mediated mode the renewal credential is handed to the backing
    /// service to set as a non-script-readable cookie and is never kept
    /// client-side. If that request fails, the store falls back to local mode
    /// for this session rather than dropping the credential.
    #[instrument(skip_all)]
    pub async fn save(
        &self,
        access_token: &str,
        renewal_token: Option<&str>,
        device: Option<DeviceState>,
    ) -> Result<Credential, ClientError> {
        let mut mode = self.mode();

        if mode == CredentialMode::ServerMediated {
            if let Some(renewal) = renewal_token {
                if let Err(e) = self.persist_renewal_cookie(renewal).await {
                    warn!(
                        "server-mediated credential save failed, falling back to local storage: {}",
                        e
                    );
                    mode = CredentialMode::Local;
                    if let Ok(mut effective) = self.effective_mode.write() {
                        *effective = CredentialMode::Local;
                    }
                }
            }
        }

        let persisted_renewal = match mode {
            CredentialMode::ServerMediated => None,
            CredentialMode::Local => renewal_token,
        };

        let credential = self.credential_from_parts(access_token, persisted_renewal)?;

        let device = device.unwrap_or_else(|| {
            self.device
                .read()
                .map(|d| d.clone())
                .unwrap_or_default()
        });

        let session = StoredSession {
            access_token: access_token.to_string(),
            renewal_token: persisted_renewal.map(|t| t.to_string()),
            device_name: device.device_name.clone(),
            trusted: device.trusted,
            new_device: device.new_device,
        };
        let plain = serde_json::to_string(&session)
            .map_err(|e| ClientError::Credential(format!("failed to encode session: {}", e)))?;
        self.backend.write(
            SESSION_KEY,
            &obfuscate(&plain, self.storage_key.expose_secret()),
        );

        if let Ok(mut current_device) = self.device.write() {
            *current_device = device;
        }
        if let Ok(mut current) = self.current.write() {
            *current = Some(credential.clone());
        }
        self.generation.fetch_add(1, Ordering::SeqCst);

        Ok(credential)
    }

    /// Drop the credential and all persisted state.
    pub fn clear(&self) {
        self.backend.remove(SESSION_KEY);
        if let Ok(mut current) = self.current.write() {
            *current = None;
        }
        if let Ok(mut device) = self.device.write() {
            *device = DeviceState::default();
        }
        if let Ok(mut effective) = self.effective_mode.write() {
            *effective = self.configured_mode;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Snapshot of the current credential, if any.
    pub fn load(&self) -> Option<Credential> {
        self.current.read().ok()?.clone()
    }

    /// Whether the current credential is missing or past its expiry claim.
    pub fn is_expired(&self) -> bool {
        self.load().map_or(true, |credential| credential.is_expired())
    }

    /// Monotonic counter bumped on every save and clear. Recovery paths use
    /// it to join an already-completed refresh instead of duplicating it.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn access_token(&self) -> Option<Secret<String>> {
        self.load().map(|credential| credential.access_token)
    }

    /// The renewal credential, when it is held client-side. Always `None` in
    /// server-mediated mode: the cookie travels with the HTTP stack instead.
    pub fn renewal_token(&self) -> Option<Secret<String>> {
        self.load().and_then(|credential| credential.renewal_token)
    }

    pub fn device_state(&self) -> DeviceState {
        self.device.read().map(|d| d.clone()).unwrap_or_default()
    }

    /// The storage mode in effect for this session (may differ from the
    /// configured mode after a server-mediated save failure).
    pub fn mode(&self) -> CredentialMode {
        self.effective_mode
            .read()
            .map(|mode| *mode)
            .unwrap_or(self.configured_mode)
    }

    fn credential_from_parts(
        &self,
        access_token: &str,
        renewal_token: Option<&str>,
    ) -> Result<Credential, ClientError> {
        let claims = claims::decode_claims(access_token)
            .map_err(|e| ClientError::Credential(e.to_string()))?;
        Ok(Credential {
            access_token: Secret::new(access_token.to_string()),
            renewal_token: renewal_token.map(|t| Secret::new(t.to_string())),
            subject: claims.sub.clone(),
            role: claims.role,
            expires_at: claims.expires_at(),
        })
    }

    async fn persist_renewal_cookie(&self, renewal_token: &str) -> Result<(), ClientError> {
        let request = TransportRequest::new(Method::POST, RENEWAL_COOKIE_PATH)
            .json(json!({ "renewalToken": renewal_token }));
        let response = self.transport.execute(request).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(ClientError::Api {
                status: response.status.as_u16(),
                message: response.body,
            })
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("mode", &self.mode())
            .field("has_credential", &self.load().is_some())
            .finish_non_exhaustive()
    }
}
