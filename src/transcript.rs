use crate::error::{ ChatError, ChatResult };
use crate::models::chat::{ ChatMessage, Role };

/// Ordered conversation history with the append/grow discipline used while a reply
/// streams in: a user message opens a turn, deltas grow the assistant message that follows
/// it, and `finalize` freezes that reply.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
    streaming: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds an idle transcript from stored messages. Duplicate ids keep their first
    /// occurrence.
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        let mut transcript = Self::new();
        for message in messages {
            if transcript.get(&message.id).is_none() {
                transcript.messages.push(message);
            }
        }
        transcript
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    pub fn get(&self, id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn append_user(&mut self, text: impl Into<String>) -> ChatResult<&ChatMessage> {
        if self.streaming {
            return Err(ChatError::Busy);
        }
        self.messages.push(ChatMessage::user(text));
        Ok(&self.messages[self.messages.len() - 1])
    }

    /// Marks a request as in flight.
    pub fn begin_streaming(&mut self) -> ChatResult<()> {
        if self.streaming {
            return Err(ChatError::Busy);
        }
        self.streaming = true;
        Ok(())
    }

    /// Appends `text` to the trailing assistant message, or opens one after a user message.
    /// Returns the message that changed.
    pub fn apply_delta(&mut self, text: &str) -> &ChatMessage {
        let extend = matches!(self.messages.last(), Some(m) if m.role == Role::Assistant);
        if extend {
            let last = self.messages.len() - 1;
            self.messages[last].content.push_str(text);
        } else {
            self.messages.push(ChatMessage::assistant(text));
        }
        &self.messages[self.messages.len() - 1]
    }

    /// Ends the streaming state and returns the reply produced for this turn, if any delta
    /// arrived.
    pub fn finalize(&mut self) -> Option<&ChatMessage> {
        self.streaming = false;
        self.messages.last().filter(|m| m.role == Role::Assistant)
    }

    /// Ends the streaming state without producing a reply (error or cancellation).
    pub fn end_streaming(&mut self) {
        self.streaming = false;
    }

    pub fn remove(&mut self, id: &str) -> Option<ChatMessage> {
        let idx = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(idx))
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.streaming = false;
    }
}
