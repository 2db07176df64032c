use crate::core::errors::ClientError;
use crate::core::kernel::codec::WsCodec;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{instrument, warn};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000, // 10 seconds
        }
    }
}

/// WebSocket session trait - pure transport layer.
///
/// Reconnection policy, state reporting and group bookkeeping live in the
/// channel manager; this layer only moves frames.
#[async_trait]
pub trait WsSession<C: WsCodec>: Send + Sync {
    /// Connect to the WebSocket
    async fn connect(&mut self) -> Result<(), ClientError>;

    /// Send a raw message
    async fn send_raw(&mut self, msg: Message) -> Result<(), ClientError>;

    /// Receive the next raw message
    async fn next_raw(&mut self) -> Option<Result<Message, ClientError>>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), ClientError>;

    /// Check if the connection is alive
    fn is_connected(&self) -> bool;

    /// Join a subscription group using the codec
    async fn join(&mut self, group: &str) -> Result<(), ClientError>;

    /// Leave a subscription group using the codec
    async fn leave(&mut self, group: &str) -> Result<(), ClientError>;

    /// Get the next decoded message
    async fn next_event(&mut self) -> Option<Result<C::Message, ClientError>>;
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Tungstenite-based WebSocket implementation.
pub struct TungsteniteWs<C: WsCodec> {
    url: String,
    write: Option<futures_util::stream::SplitSink<WsStream, Message>>,
    read: Option<futures_util::stream::SplitStream<WsStream>>,
    connected: bool,
    channel_name: String,
    codec: C,
    config: WsConfig,
}

impl<C: WsCodec> TungsteniteWs<C> {
    /// Create a new WebSocket session with the specified codec.
    ///
    /// # Arguments
    /// * `url` - The WebSocket URL to connect to
    /// * `channel_name` - Name of the logical channel for logging/tracing
    /// * `codec` - The codec to handle message encoding/decoding
    pub fn new(url: String, channel_name: String, codec: C) -> Self {
        Self {
            url,
            write: None,
            read: None,
            connected: false,
            channel_name,
            codec,
            config: WsConfig::default(),
        }
    }

    /// Set custom WebSocket configuration
    pub fn with_config(mut self, config: WsConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<C: WsCodec> WsSession<C> for TungsteniteWs<C> {
    #[instrument(skip(self), fields(channel = %self.channel_name))]
    async fn connect(&mut self) -> Result<(), ClientError> {
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(&self.url))
            .await
            .map_err(|_| ClientError::Channel("WebSocket connection timeout".to_string()))?
            .map_err(|e| ClientError::Network(format!("WebSocket connection failed: {}", e)))?;

        let (write, read) = ws_stream.split();
        self.write = Some(write);
        self.read = Some(read);
        self.connected = true;

        Ok(())
    }

    #[instrument(skip(self, msg), fields(channel = %self.channel_name))]
    async fn send_raw(&mut self, msg: Message) -> Result<(), ClientError> {
        if !self.connected {
            return Err(ClientError::Channel("WebSocket not connected".to_string()));
        }

        let write = self
            .write
            .as_mut()
            .ok_or_else(|| ClientError::Channel("WebSocket write stream not available".to_string()))?;

        write.send(msg).await.map_err(|e| {
            self.connected = false;
            ClientError::Network(format!("Failed to send WebSocket message: {}", e))
        })?;

        Ok(())
    }

    async fn next_raw(&mut self) -> Option<Result<Message, ClientError>> {
        if !self.connected {
            return Some(Err(ClientError::Channel(
                "WebSocket not connected".to_string(),
            )));
        }

        loop {
            // Bind the frame first so the stream borrow ends before any
            // control-frame response is written back through `self`.
            let next = {
                let read = self.read.as_mut()?;
                read.next().await
            };

            match next {
                Some(Ok(message)) => match &message {
                    Message::Close(_) => {
                        self.connected = false;
                        return Some(Ok(message));
                    }
                    Message::Ping(data) => {
                        // Auto-respond to pings at transport level
                        let pong = Message::Pong(data.clone());
                        if let Err(e) = self.send_raw(pong).await {
                            warn!(channel = %self.channel_name, "failed to send pong response: {}", e);
                        }
                    }
                    Message::Pong(_) => {}
                    _ => return Some(Ok(message)),
                },
                Some(Err(e)) => {
                    self.connected = false;
                    return Some(Err(ClientError::Network(format!("WebSocket error: {}", e))));
                }
                None => {
                    self.connected = false;
                    return None;
                }
            }
        }
    }

    #[instrument(skip(self), fields(channel = %self.channel_name))]
    async fn close(&mut self) -> Result<(), ClientError> {
        if let Some(write) = self.write.as_mut() {
            let _ = write.send(Message::Close(None)).await;
        }
        self.connected = false;
        self.write = None;
        self.read = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    #[instrument(skip(self), fields(channel = %self.channel_name, group = %group))]
    async fn join(&mut self, group: &str) -> Result<(), ClientError> {
        let message = self.codec.encode_join(group)?;
        self.send_raw(message).await
    }

    #[instrument(skip(self), fields(channel = %self.channel_name, group = %group))]
    async fn leave(&mut self, group: &str) -> Result<(), ClientError> {
        let message = self.codec.encode_leave(group)?;
        self.send_raw(message).await
    }

    async fn next_event(&mut self) -> Option<Result<C::Message, ClientError>> {
        loop {
            let next = self.next_raw().await;
            match next {
                Some(Ok(raw_msg)) => {
                    // Server-initiated close ends the stream
                    if matches!(raw_msg, Message::Close(_)) {
                        return None;
                    }
                    // Remaining control frames are handled at transport level
                    if matches!(raw_msg, Message::Ping(_) | Message::Pong(_)) {
                        continue;
                    }

                    match self.codec.decode_message(raw_msg) {
                        Ok(Some(decoded)) => return Some(Ok(decoded)),
                        Ok(None) => {} // Codec chose to ignore this message
                        Err(e) => return Some(Err(e)),
                    }
                }
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        }
    }
}
