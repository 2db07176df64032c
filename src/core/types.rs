use chrono::{DateTime, Utc};
use secrecy::Secret;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Server-pushed event name for generic notifications.
pub const NOTIFICATION_EVENT: &str = "notification";

/// Role claim embedded in the access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Patient,
    Clinician,
    Admin,
    #[serde(other)]
    Unknown,
}

/// The authenticated user as returned by the auth endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: UserRole,
}

/// The current bearer credential and its decoded claims.
///
/// Never mutated in place: a refresh produces a brand-new `Credential` that
/// atomically replaces the old one in the session store.
#[derive(Clone)]
pub struct Credential {
    pub access_token: Secret<String>,
    /// `None` in server-mediated mode, where the renewal credential lives in a
    /// non-script-readable cookie and is attached by the HTTP stack.
    pub renewal_token: Option<Secret<String>>,
    pub subject: String,
    pub role: UserRole,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("renewal_token", &self.renewal_token.as_ref().map(|_| "[REDACTED]"))
            .field("subject", &self.subject)
            .field("role", &self.role)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The persisted form of a session: credentials plus device metadata.
///
/// Written once per login, read on bootstrap, cleared on logout. The plaintext
/// is zeroed on drop; at rest it is obfuscated by the session store.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub access_token: String,
    #[serde(default)]
    pub renewal_token: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub new_device: bool,
}

impl fmt::Debug for StoredSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredSession")
            .field("access_token", &"[REDACTED]")
            .field("renewal_token", &self.renewal_token.as_ref().map(|_| "[REDACTED]"))
            .field("device_name", &self.device_name)
            .field("trusted", &self.trusted)
            .field("new_device", &self.new_device)
            .finish()
    }
}

/// Generic server-pushed notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    pub category: String,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Kinds of security events pushed on the security channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEventKind {
    NewDeviceLogin,
    SessionRevoked,
    SuspiciousActivity,
    PasswordChanged,
}

impl SecurityEventKind {
    /// The wire event name this kind is dispatched under.
    pub const fn event_name(self) -> &'static str {
        match self {
            Self::NewDeviceLogin => "security:new-device-login",
            Self::SessionRevoked => "security:session-revoked",
            Self::SuspiciousActivity => "security:suspicious-activity",
            Self::PasswordChanged => "security:password-changed",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "security:new-device-login" => Some(Self::NewDeviceLogin),
            "security:session-revoked" => Some(Self::SessionRevoked),
            "security:suspicious-activity" => Some(Self::SuspiciousActivity),
            "security:password-changed" => Some(Self::PasswordChanged),
            _ => None,
        }
    }

    pub const ALL: [Self; 4] = [
        Self::NewDeviceLogin,
        Self::SessionRevoked,
        Self::SuspiciousActivity,
        Self::PasswordChanged,
    ];
}

/// Device/location metadata attached to every security event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEventDetails {
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// A security event with its kind resolved from the wire event name.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub kind: SecurityEventKind,
    pub details: SecurityEventDetails,
}

/// Lifecycle of a real-time channel connection.
///
/// `Failed` is terminal: it is reached only after the reconnect budget is
/// exhausted and requires an explicit `connect` (typically after a fresh
/// login) to leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
