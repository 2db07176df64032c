use crate::core::errors::ClientError;
use crate::core::kernel::WsCodec;
use serde_json::{json, Map, Value};
use tokio_tungstenite::tungstenite::Message;

/// A named server-pushed event with its raw payload.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub name: String,
    pub data: Value,
}

/// Codec for the channel wire protocol.
///
/// Client → server: `{"action": "join" | "leave", "group": "..."}`.
/// Server → client: `{"event": "...", "data": {...}}`; frames without an
/// `event` field (acks, keepalives) are ignored.
pub struct EventCodec;

impl WsCodec for EventCodec {
    type Message = ServerEvent;

    fn encode_join(&self, group: &str) -> Result<Message, ClientError> {
        let command = json!({
            "action": "join",
            "group": group,
        });
        Ok(Message::Text(command.to_string()))
    }

    fn encode_leave(&self, group: &str) -> Result<Message, ClientError> {
        let command = json!({
            "action": "leave",
            "group": group,
        });
        Ok(Message::Text(command.to_string()))
    }

    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ClientError> {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => String::from_utf8(data).map_err(|e| {
                ClientError::MalformedResponse(format!("invalid UTF-8 in binary frame: {}", e))
            })?,
            _ => return Ok(None), // Ignore other message types
        };

        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ClientError::MalformedResponse(format!("failed to parse channel frame: {}", e))
        })?;

        let Some(name) = value.get("event").and_then(Value::as_str) else {
            // Subscription acks and keepalives carry no event name
            return Ok(None);
        };

        let data = value
            .get("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));

        Ok(Some(ServerEvent {
            name: name.to_string(),
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_join_and_leave_commands() {
        let codec = EventCodec;
        let join = codec.encode_join("user:42").unwrap();
        let Message::Text(text) = join else {
            panic!("expected a text frame")
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["action"], "join");
        assert_eq!(value["group"], "user:42");

        let leave = codec.encode_leave("user:42").unwrap();
        let Message::Text(text) = leave else {
            panic!("expected a text frame")
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["action"], "leave");
    }

    #[test]
    fn decodes_named_events() {
        let codec = EventCodec;
        let frame = Message::Text(
            "{\"event\":\"notification\",\"data\":{\"Id\":\"n-1\",\"Title\":\"hi\"}}".to_string(),
        );
        let event = codec.decode_message(frame).unwrap().unwrap();
        assert_eq!(event.name, "notification");
        assert_eq!(event.data["Id"], "n-1");
    }

    #[test]
    fn frames_without_an_event_name_are_ignored() {
        let codec = EventCodec;
        let ack = Message::Text("{\"ok\":true,\"group\":\"user:42\"}".to_string());
        assert!(codec.decode_message(ack).unwrap().is_none());
    }

    #[test]
    fn missing_data_defaults_to_an_empty_object() {
        let codec = EventCodec;
        let frame = Message::Text("{\"event\":\"security:password-changed\"}".to_string());
        let event = codec.decode_message(frame).unwrap().unwrap();
        assert_eq!(event.data, Value::Object(Map::new()));
    }

    #[test]
    fn garbage_frames_error_without_panicking() {
        let codec = EventCodec;
        let frame = Message::Text("not json".to_string());
        assert!(codec.decode_message(frame).is_err());
    }
}
