use crate::core::errors::ClientError;
use tokio_tungstenite::tungstenite::Message;

/// Codec trait for the real-time channel wire protocol.
///
/// Converts between raw WebSocket frames and typed channel messages. Control
/// frames (ping, pong, close) are handled at the transport level and never
/// reach the codec.
pub trait WsCodec: Send + Sync + 'static {
    /// The type representing parsed server-pushed messages.
    type Message: Send + Sync;

    /// Encode a "join group" command for the given subscription group.
    fn encode_join(&self, group: &str) -> Result<Message, ClientError>;

    /// Encode a "leave group" command for the given subscription group.
    fn encode_leave(&self, group: &str) -> Result<Message, ClientError>;

    /// Decode a raw WebSocket message into a typed message.
    ///
    /// # Returns
    /// - `Ok(Some(message))` - Successfully decoded message
    /// - `Ok(None)` - Message was ignored/filtered by the codec
    /// - `Err(error)` - Failed to decode message
    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ClientError>;
}
