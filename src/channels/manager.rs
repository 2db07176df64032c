use crate::api::transform;
use crate::auth::store::SessionStore;
use crate::channels::codec::{EventCodec, ServerEvent};
use crate::channels::dispatcher::{EventDispatcher, Subscription};
use crate::core::errors::ClientError;
use crate::core::kernel::{TungsteniteWs, WsConfig, WsSession};
use crate::core::types::{ChannelState, Credential};
use rand::Rng;
use secrecy::ExposeSecret;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Reconnect delay schedule in seconds: non-decreasing and bounded to avoid
/// thundering-herd reconnect storms while still recovering quickly from
/// transient blips. One attempt per entry, then the channel fails.
pub const RECONNECT_SCHEDULE_SECONDS: [u64; 5] = [0, 2, 5, 10, 30];

/// Maximum random jitter added to each non-zero reconnect delay.
const RECONNECT_JITTER_MS: u64 = 250;

/// Configuration for one logical channel concern.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel name for logging and tracing
    pub name: String,
    /// Full WebSocket endpoint URL
    pub url: String,
    /// Apply wire-field case normalization to event payloads
    pub normalize_keys: bool,
    /// Reconnect delay schedule; its length is the attempt budget
    pub backoff: Vec<Duration>,
    /// Handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            normalize_keys: true,
            backoff: RECONNECT_SCHEDULE_SECONDS
                .iter()
                .map(|&secs| Duration::from_secs(secs))
                .collect(),
            connect_timeout_ms: 10_000,
        }
    }

    /// The general notification concern.
    pub fn notifications(ws_base_url: &str) -> Self {
        Self::new("notifications", format!("{}/ws/notifications", ws_base_url))
    }

    /// The security event concern.
    pub fn security(ws_base_url: &str) -> Self {
        Self::new("security", format!("{}/ws/security", ws_base_url))
    }

    #[must_use]
    pub const fn normalize_keys(mut self, normalize: bool) -> Self {
        self.normalize_keys = normalize;
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }
}

struct ActiveConnection {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Owns one persistent channel connection and its lifecycle.
///
/// State machine: Disconnected → Connecting → Connected → {Reconnecting →
/// Connected | Failed}. `Failed` is reached only after the reconnect budget
/// is exhausted and requires an explicit `connect` to leave. The automatic
/// reconnect path never returns errors to callers; observers watch state
/// transitions instead.
pub struct ChannelManager {
    config: ChannelConfig,
    sessions: Arc<SessionStore>,
    dispatcher: Arc<EventDispatcher>,
    state_tx: watch::Sender<ChannelState>,
    state_rx: watch::Receiver<ChannelState>,
    groups: Arc<StdMutex<BTreeSet<String>>>,
    active: Mutex<Option<ActiveConnection>>,
}

impl ChannelManager {
    pub fn new(config: ChannelConfig, sessions: Arc<SessionStore>) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        Self {
            config,
            sessions,
            dispatcher: Arc::new(EventDispatcher::new()),
            state_tx,
            state_rx,
            groups: Arc::new(StdMutex::new(BTreeSet::new())),
            active: Mutex::new(None),
        }
    }

    /// Open the channel for the given subject, joining `user:<id>`.
    ///
    /// Idempotent while already Connecting/Connected/Reconnecting: concurrent
    /// callers coalesce onto the in-flight connection rather than spawning
    /// duplicates. Fails fast without a network handshake when no usable
    /// credential is held.
    #[instrument(skip(self), fields(channel = %self.config.name, subject = %subject_id))]
    pub async fn connect(&self, subject_id: &str) -> Result<(), ClientError> {
        let mut active = self.active.lock().await;

        if matches!(
            self.state(),
            ChannelState::Connecting | ChannelState::Connected | ChannelState::Reconnecting
        ) {
            debug!("connect coalesced onto existing connection");
            return Ok(());
        }

        if usable_credential(&self.sessions).is_none() {
            return Err(ClientError::AuthenticationExpired);
        }

        if let Ok(mut groups) = self.groups.lock() {
            groups.clear();
            groups.insert(format!("user:{}", subject_id));
        }

        // Drop the finished task from a previous session, if any
        active.take();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _ = self.state_tx.send(ChannelState::Connecting);

        let context = RunContext {
            config: self.config.clone(),
            sessions: Arc::clone(&self.sessions),
            dispatcher: Arc::clone(&self.dispatcher),
            state_tx: self.state_tx.clone(),
            groups: Arc::clone(&self.groups),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(run_loop(context));

        *active = Some(ActiveConnection {
            task,
            shutdown: shutdown_tx,
        });
        Ok(())
    }

    /// Tear the channel down: cancel any pending reconnect timer, close the
    /// socket, release all subscriptions and return to Disconnected.
    #[instrument(skip(self), fields(channel = %self.config.name))]
    pub async fn disconnect(&self) {
        let mut active = self.active.lock().await;
        if let Some(connection) = active.take() {
            let _ = connection.shutdown.send(true);
            if connection.task.await.is_err() {
                warn!("channel task ended abnormally during disconnect");
            }
        }
        let _ = self.state_tx.send(ChannelState::Disconnected);
        if let Ok(mut groups) = self.groups.lock() {
            groups.clear();
        }
        self.dispatcher.clear();
    }

    /// Register a handler for a named server-pushed event.
    pub fn on(&self, event: &str, handler: impl Fn(Value) + Send + Sync + 'static) -> Subscription {
        self.dispatcher.subscribe(event, handler)
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions (Connected, Reconnecting, Failed, ...).
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Groups currently tracked for (re)subscription.
    pub fn joined_groups(&self) -> Vec<String> {
        self.groups
            .lock()
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn dispatcher(&self) -> Arc<EventDispatcher> {
        Arc::clone(&self.dispatcher)
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct RunContext {
    config: ChannelConfig,
    sessions: Arc<SessionStore>,
    dispatcher: Arc<EventDispatcher>,
    state_tx: watch::Sender<ChannelState>,
    groups: Arc<StdMutex<BTreeSet<String>>>,
    shutdown: watch::Receiver<bool>,
}

enum LoopExit {
    Shutdown,
    ConnectionLost,
}

fn usable_credential(sessions: &SessionStore) -> Option<Credential> {
    sessions.load().filter(|credential| !credential.is_expired())
}

async fn run_loop(mut context: RunContext) {
    let channel = context.config.name.clone();
    let max_attempts = context.config.backoff.len() as u32;
    let mut failed_attempts: u32 = 0;

    loop {
        if *context.shutdown.borrow() {
            return;
        }

        // The credential is read fresh for every handshake; a refresh may
        // have replaced it since the last attempt.
        let Some(credential) = usable_credential(&context.sessions) else {
            warn!(channel = %channel, "no usable credential for channel handshake");
            let _ = context.state_tx.send(ChannelState::Failed);
            return;
        };

        let url = format!(
            "{}?token={}",
            context.config.url,
            credential.access_token.expose_secret()
        );
        let mut session = TungsteniteWs::new(url, channel.clone(), EventCodec).with_config(WsConfig {
            connect_timeout_ms: context.config.connect_timeout_ms,
        });

        match establish(&mut session, &context).await {
            Ok(()) => {
                failed_attempts = 0;
                let _ = context.state_tx.send(ChannelState::Connected);
                info!(channel = %channel, "channel connected");

                match read_until_disconnect(&mut session, &mut context).await {
                    LoopExit::Shutdown => {
                        let _ = session.close().await;
                        return;
                    }
                    LoopExit::ConnectionLost => {
                        warn!(channel = %channel, "channel connection lost");
                        let _ = context.state_tx.send(ChannelState::Reconnecting);
                    }
                }
            }
            Err(e) => {
                failed_attempts += 1;
                warn!(
                    channel = %channel,
                    attempt = failed_attempts,
                    "connection attempt failed: {}", e
                );
                if failed_attempts >= max_attempts {
                    error!(channel = %channel, "reconnect budget exhausted; channel failed");
                    let _ = context.state_tx.send(ChannelState::Failed);
                    return;
                }
                let _ = context.state_tx.send(ChannelState::Reconnecting);

                let delay = backoff_delay(&context.config.backoff, failed_attempts);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = context.shutdown.changed() => return,
                }
            }
        }
    }
}

/// Connect and re-join every tracked group. The channel is not usable (and
/// never reports Connected) until all joins have been written to the socket:
/// a restored connection that forgot its group membership would silently stop
/// delivering events.
async fn establish(
    session: &mut TungsteniteWs<EventCodec>,
    context: &RunContext,
) -> Result<(), ClientError> {
    session.connect().await?;

    let groups: Vec<String> = context
        .groups
        .lock()
        .map(|groups| groups.iter().cloned().collect())
        .unwrap_or_default();
    for group in groups {
        session.join(&group).await?;
    }
    Ok(())
}

async fn read_until_disconnect(
    session: &mut TungsteniteWs<EventCodec>,
    context: &mut RunContext,
) -> LoopExit {
    loop {
        tokio::select! {
            changed = context.shutdown.changed() => {
                if changed.is_err() || *context.shutdown.borrow() {
                    return LoopExit::Shutdown;
                }
            }
            event = session.next_event() => {
                match event {
                    Some(Ok(ServerEvent { name, data })) => {
                        let payload = if context.config.normalize_keys {
                            transform::normalize(data)
                        } else {
                            data
                        };
                        context.dispatcher.emit(&name, payload);
                    }
                    Some(Err(e)) => {
                        warn!("channel read error: {}", e);
                        return LoopExit::ConnectionLost;
                    }
                    None => return LoopExit::ConnectionLost,
                }
            }
        }
    }
}

/// Delay preceding reconnect attempt `failed_attempts + 1`, with jitter so a
/// fleet of clients does not reconnect in lockstep.
fn backoff_delay(schedule: &[Duration], failed_attempts: u32) -> Duration {
    let index = (failed_attempts as usize).min(schedule.len().saturating_sub(1));
    let base = schedule[index];
    if base.is_zero() {
        base
    } else {
        base + Duration::from_millis(rand::thread_rng().gen_range(0..RECONNECT_JITTER_MS))
    }
}
