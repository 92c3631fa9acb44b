use serde::{ Serialize, Deserialize };

use super::chat::ChatMessage;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "chat")] Chat {
        content: String,
    },
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "load")] Load {
        conversation_id: String,
    },
    #[serde(rename = "new")]
    New,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "conversation")] Conversation {
        id: Option<String>,
        messages: Vec<ChatMessage>,
    },
    #[serde(rename = "partial")] Partial {
        message_id: String,
        content: String,
    },
    #[serde(rename = "done")] Done {
        message_id: Option<String>,
        timestamp: i64,
    },
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "error")] Error {
        message: String,
    },
    #[serde(rename = "warning")] Warning {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_are_type_tagged() {
        let chat: ClientMessage = serde_json::from_str(r#"{"type":"chat","content":"Salam"}"#).unwrap();
        assert_eq!(chat, ClientMessage::Chat { content: "Salam".to_string() });

        let stop: ClientMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert_eq!(stop, ClientMessage::Stop);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reload"}"#).is_err());
    }

    #[test]
    fn partial_serializes_with_tag() {
        let msg = ServerMessage::Partial { message_id: "m1".to_string(), content: "Wal".to_string() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "partial", "message_id": "m1", "content": "Wal" }));
    }
}
