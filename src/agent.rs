use crate::error::{ ChatError, ChatResult };
use crate::history::HistoryStore;
use crate::llm::chat::{ ChatClient, ChatRequest, DeltaStream };
use crate::models::chat::ChatMessage;
use crate::transcript::Transcript;

use futures::StreamExt;
use log::{ debug, error, info, warn };
use std::fmt;
use std::str::FromStr;
use std::sync::{ Arc, Mutex, MutexGuard };
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// What happens to the question when its request fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackPolicy {
    /// Remove the unanswered question (and any partial reply) from the transcript and history.
    #[default]
    RemoveQuestion,
    KeepQuestion,
}

impl FromStr for RollbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "remove" | "remove_question" => Ok(RollbackPolicy::RemoveQuestion),
            "keep" | "keep_question" => Ok(RollbackPolicy::KeepQuestion),
            _ => Err(format!("Invalid rollback policy: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    pub system_prompt: Option<String>,
    pub rollback_policy: RollbackPolicy,
}

/// Progress of a send, in the order it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Started {
        user_message_id: String,
    },
    Delta {
        message_id: String,
        text: String,
    },
    Finished {
        message: Option<ChatMessage>,
    },
    Stopped,
    Failed {
        error: ChatError,
    },
    PersistenceFailed {
        message_id: String,
        error: ChatError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The reply ended normally. `None` when the model produced no text.
    Completed {
        message: Option<ChatMessage>,
    },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    Streaming,
    Finalized,
    Cancelled,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finalized | SessionState::Cancelled | SessionState::Errored)
    }

    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Sending) => true,
            (Sending, Streaming) => true,
            (Streaming, Finalized) => true,
            (Idle | Sending | Streaming, Cancelled | Errored) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Sending => "sending",
            SessionState::Streaming => "streaming",
            SessionState::Finalized => "finalized",
            SessionState::Cancelled => "cancelled",
            SessionState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// One outbound request: its state, the text received so far and the token that aborts it.
#[derive(Debug)]
pub struct StreamSession {
    state: SessionState,
    accumulated: String,
    token: CancellationToken,
}

impl StreamSession {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            state: SessionState::Idle,
            accumulated: String::new(),
            token,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Moves to `next`. Terminal states are final; an illegal move is ignored and
    /// returns false.
    pub fn advance(&mut self, next: SessionState) -> bool {
        if !self.state.can_advance_to(next) {
            debug!("Ignoring stream session transition {} -> {}", self.state, next);
            return false;
        }
        debug!("Stream session {} -> {}", self.state, next);
        self.state = next;
        true
    }

    fn push(&mut self, delta: &str) {
        self.accumulated.push_str(delta);
    }
}

enum StreamEnd {
    Completed,
    Cancelled,
    Failed(ChatError),
}

type Slot = Arc<Mutex<Option<CancellationToken>>>;

/// A claim on an agent's single request slot, taken before any await so that `cancel`
/// already reaches the request while its setup is still running. Dropping it, including
/// with the future that owns it, frees the slot.
pub struct Reservation {
    slot: Slot,
    token: CancellationToken,
}

impl Reservation {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        *lock(&self.slot) = None;
    }
}

fn lock(slot: &Mutex<Option<CancellationToken>>) -> MutexGuard<'_, Option<CancellationToken>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

fn emit(events: &UnboundedSender<ChatEvent>, event: ChatEvent) {
    if events.send(event).is_err() {
        debug!("Chat event receiver dropped");
    }
}

/// Drives one request at a time for a single transcript owner: appends the question,
/// applies deltas as they arrive, persists at the fixed points of the lifecycle and
/// reports progress as `ChatEvent`s.
pub struct ChatAgent {
    client: Arc<dyn ChatClient>,
    history: Option<Arc<dyn HistoryStore>>,
    options: AgentOptions,
    in_flight: Slot,
}

impl ChatAgent {
    /// `history: None` runs in guest mode.
    pub fn new(
        client: Arc<dyn ChatClient>,
        history: Option<Arc<dyn HistoryStore>>,
        options: AgentOptions
    ) -> Self {
        Self {
            client,
            history,
            options,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    pub fn history(&self) -> Option<&Arc<dyn HistoryStore>> {
        self.history.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Aborts the request in flight, if any. Calling it again, or while idle, does nothing.
    pub fn cancel(&self) {
        if let Some(token) = lock(&self.in_flight).as_ref() {
            if !token.is_cancelled() {
                info!("Cancelling chat request in flight");
                token.cancel();
            }
        }
    }

    /// Claims the request slot. Fails with `Busy` while another request holds it.
    pub fn reserve(&self) -> ChatResult<Reservation> {
        let mut slot = lock(&self.in_flight);
        if slot.is_some() {
            return Err(ChatError::Busy);
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        Ok(Reservation { slot: self.in_flight.clone(), token })
    }

    /// Sends `text` as the next user turn of `transcript` and streams the reply into it.
    ///
    /// A cancelled request returns `SendOutcome::Stopped` and keeps whatever text already
    /// arrived. Any other failure applies the rollback policy and returns the error.
    pub async fn send(
        &self,
        transcript: &mut Transcript,
        conversation_id: Option<&str>,
        text: &str,
        events: &UnboundedSender<ChatEvent>
    ) -> ChatResult<SendOutcome> {
        let reservation = self.reserve()?;
        self.send_reserved(reservation, transcript, conversation_id, text, events).await
    }

    /// `send` on a slot claimed earlier with `reserve`. If `cancel` was called in between,
    /// the question is recorded and the request stops before it goes out.
    pub async fn send_reserved(
        &self,
        reservation: Reservation,
        transcript: &mut Transcript,
        conversation_id: Option<&str>,
        text: &str,
        events: &UnboundedSender<ChatEvent>
    ) -> ChatResult<SendOutcome> {
        if !Arc::ptr_eq(&reservation.slot, &self.in_flight) {
            return Err(ChatError::Busy);
        }
        let token = reservation.token.clone();
        if transcript.is_streaming() {
            return Err(ChatError::Busy);
        }

        let user_message = transcript.append_user(text)?.clone();
        transcript.begin_streaming()?;
        emit(events, ChatEvent::Started { user_message_id: user_message.id.clone() });

        let mut session = StreamSession::new(token);
        if let Some(id) = conversation_id {
            self.persist(id, &user_message, events).await;
        }

        let end = self.drive(transcript, &mut session, events).await;
        match end {
            StreamEnd::Completed => {
                session.advance(SessionState::Finalized);
                let reply = transcript.finalize().cloned();
                info!(
                    "Chat reply finished ({} chars)",
                    session.accumulated().chars().count()
                );
                emit(events, ChatEvent::Finished { message: reply.clone() });
                if let (Some(id), Some(message)) = (conversation_id, reply.as_ref()) {
                    if !message.content.is_empty() {
                        self.persist(id, message, events).await;
                    }
                }
                Ok(SendOutcome::Completed { message: reply })
            }
            StreamEnd::Cancelled => {
                session.advance(SessionState::Cancelled);
                transcript.end_streaming();
                info!("Chat request stopped by the user");
                emit(events, ChatEvent::Stopped);
                Ok(SendOutcome::Stopped)
            }
            StreamEnd::Failed(err) => {
                session.advance(SessionState::Errored);
                transcript.end_streaming();
                error!("Chat request failed: {}", err);
                emit(events, ChatEvent::Failed { error: err.clone() });
                self.rollback(transcript, conversation_id, &user_message, events).await;
                Err(err)
            }
        }
    }

    fn build_request(&self, transcript: &Transcript) -> ChatRequest {
        let request = ChatRequest::new(transcript.messages().to_vec());
        match &self.options.system_prompt {
            Some(prompt) => request.with_system_prompt(prompt.clone()),
            None => request,
        }
    }

    async fn drive(
        &self,
        transcript: &mut Transcript,
        session: &mut StreamSession,
        events: &UnboundedSender<ChatEvent>
    ) -> StreamEnd {
        let token = session.token().clone();
        let request = self.build_request(transcript);
        session.advance(SessionState::Sending);
        debug!(
            "Sending {} messages to {} ({})",
            request.messages.len(),
            self.client.get_llm_type(),
            self.client.get_model()
        );

        let opened: ChatResult<DeltaStream> =
            tokio::select! {
            biased;
            _ = token.cancelled() => Err(ChatError::Cancelled),
            result = self.client.stream_chat(&request, token.clone()) => result,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(ChatError::Cancelled) => {
                return StreamEnd::Cancelled;
            }
            Err(err) => {
                return StreamEnd::Failed(err);
            }
        };
        session.advance(SessionState::Streaming);

        loop {
            let item =
                tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return StreamEnd::Cancelled;
                }
                item = stream.next() => item,
            };
            match item {
                None => {
                    return StreamEnd::Completed;
                }
                Some(Ok(delta)) => {
                    if delta.is_empty() {
                        continue;
                    }
                    session.push(&delta);
                    let message_id = transcript.apply_delta(&delta).id.clone();
                    emit(events, ChatEvent::Delta { message_id, text: delta });
                }
                Some(Err(ChatError::Cancelled)) => {
                    return StreamEnd::Cancelled;
                }
                Some(Err(err)) => {
                    return StreamEnd::Failed(err);
                }
            }
        }
    }

    async fn rollback(
        &self,
        transcript: &mut Transcript,
        conversation_id: Option<&str>,
        user_message: &ChatMessage,
        events: &UnboundedSender<ChatEvent>
    ) {
        if self.options.rollback_policy == RollbackPolicy::KeepQuestion {
            return;
        }

        let position = transcript
            .messages()
            .iter()
            .position(|m| m.id == user_message.id);
        let orphaned: Vec<String> = match position {
            Some(index) =>
                transcript.messages()[index..]
                    .iter()
                    .map(|m| m.id.clone())
                    .collect(),
            None => Vec::new(),
        };
        for id in &orphaned {
            transcript.remove(id);
        }
        debug!("Rolled back {} message(s) after a failed request", orphaned.len());

        if let (Some(conv_id), Some(store)) = (conversation_id, self.history.as_ref()) {
            if let Err(e) = store.delete_message(conv_id, &user_message.id).await {
                warn!("History delete for message {} failed: {}", user_message.id, e);
                emit(events, ChatEvent::PersistenceFailed {
                    message_id: user_message.id.clone(),
                    error: ChatError::Persistence(e.to_string()),
                });
            }
        }
    }

    async fn persist(
        &self,
        conversation_id: &str,
        message: &ChatMessage,
        events: &UnboundedSender<ChatEvent>
    ) {
        let Some(store) = self.history.as_ref() else {
            return;
        };
        if let Err(e) = store.save_message(conversation_id, message).await {
            warn!("History write ({}) failed: {}", message.role, e);
            emit(events, ChatEvent::PersistenceFailed {
                message_id: message.id.clone(),
                error: ChatError::Persistence(e.to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ HistoryError, MemoryHistoryStore };
    use crate::llm::LlmType;
    use crate::models::chat::{ Conversation, Role };
    use async_trait::async_trait;
    use futures::stream;
    use tokio::sync::mpsc::{ unbounded_channel, UnboundedReceiver };
    use tokio_stream::wrappers::UnboundedReceiverStream;

    struct FakeClient {
        response: Mutex<Option<ChatResult<DeltaStream>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl FakeClient {
        fn new(response: ChatResult<DeltaStream>) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(Some(response)),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn deltas(deltas: &[&str]) -> Arc<Self> {
            let items: Vec<ChatResult<String>> = deltas
                .iter()
                .map(|d| Ok(d.to_string()))
                .collect();
            let deltas: DeltaStream = Box::pin(stream::iter(items));
            Self::new(Ok(deltas))
        }

        /// Emits `deltas`, then never produces another item.
        fn stalled(deltas: &[&str]) -> Arc<Self> {
            let items: Vec<ChatResult<String>> = deltas
                .iter()
                .map(|d| Ok(d.to_string()))
                .collect();
            let deltas: DeltaStream = Box::pin(stream::iter(items).chain(stream::pending()));
            Self::new(Ok(deltas))
        }
    }

    #[async_trait]
    impl ChatClient for FakeClient {
        async fn stream_chat(
            &self,
            request: &ChatRequest,
            _cancel: CancellationToken
        ) -> ChatResult<DeltaStream> {
            self.requests.lock().unwrap().push(request.clone());
            self.response
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| {
                    let empty: DeltaStream = Box::pin(stream::empty());
                    Ok(empty)
                })
        }

        fn get_model(&self) -> String {
            "fake".to_string()
        }

        fn get_base_url(&self) -> Option<String> {
            None
        }

        fn get_llm_type(&self) -> LlmType {
            LlmType::OpenRouter
        }
    }

    struct FailingStore;

    #[async_trait]
    impl HistoryStore for FailingStore {
        async fn create_conversation(&self, _title: &str) -> Result<String, HistoryError> {
            Ok("c1".to_string())
        }

        async fn save_message(&self, id: &str, _m: &ChatMessage) -> Result<(), HistoryError> {
            Err(HistoryError::NotFound(id.to_string()))
        }

        async fn delete_message(&self, id: &str, _m: &str) -> Result<(), HistoryError> {
            Err(HistoryError::NotFound(id.to_string()))
        }

        async fn load_conversation(&self, id: &str) -> Result<Conversation, HistoryError> {
            Err(HistoryError::NotFound(id.to_string()))
        }

        async fn rename_conversation(&self, id: &str, _title: &str) -> Result<(), HistoryError> {
            Err(HistoryError::NotFound(id.to_string()))
        }
    }

    fn drain(rx: &mut UnboundedReceiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn streams_deltas_into_one_assistant_message_and_persists_both_turns() {
        let store = Arc::new(MemoryHistoryStore::new());
        let conv_id = store.create_conversation("Hello").await.unwrap();
        let client = FakeClient::deltas(&["Wal", "ailaikum"]);
        let agent = ChatAgent::new(client.clone(), Some(store.clone()), AgentOptions {
            system_prompt: Some("Be brief.".to_string()),
            ..AgentOptions::default()
        });
        let (tx, mut rx) = unbounded_channel();
        let mut transcript = Transcript::new();

        let outcome = agent.send(&mut transcript, Some(&conv_id), "Hello", &tx).await.unwrap();

        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.messages()[0].role, Role::User);
        assert_eq!(transcript.messages()[1].content, "Walailaikum");
        assert!(!transcript.is_streaming());
        assert!(!agent.is_busy());

        let reply = transcript.messages()[1].clone();
        assert_eq!(outcome, SendOutcome::Completed { message: Some(reply.clone()) });

        let events = drain(&mut rx);
        assert!(matches!(&events[0], ChatEvent::Started { .. }));
        assert_eq!(events[1], ChatEvent::Delta {
            message_id: reply.id.clone(),
            text: "Wal".to_string(),
        });
        assert_eq!(events[2], ChatEvent::Delta {
            message_id: reply.id.clone(),
            text: "ailaikum".to_string(),
        });
        assert_eq!(events[3], ChatEvent::Finished { message: Some(reply.clone()) });

        let stored = store.load_conversation(&conv_id).await.unwrap();
        assert_eq!(stored.messages, transcript.messages().to_vec());

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests[0].system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(requests[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_removes_the_question() {
        let store = Arc::new(MemoryHistoryStore::new());
        let conv_id = store.create_conversation("t").await.unwrap();
        let client = FakeClient::new(Err(ChatError::transport(Some(401), "Unauthorized")));
        let agent = ChatAgent::new(client, Some(store.clone()), AgentOptions::default());
        let (tx, mut rx) = unbounded_channel();
        let mut transcript = Transcript::new();

        let err = agent.send(&mut transcript, Some(&conv_id), "Hello", &tx).await.unwrap_err();

        assert_eq!(err.status(), Some(401));
        assert!(transcript.is_empty());
        assert!(!transcript.is_streaming());
        assert!(store.load_conversation(&conv_id).await.unwrap().messages.is_empty());

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(ChatEvent::Failed { error }) if error.status() == Some(401)));
    }

    #[tokio::test]
    async fn mid_stream_failure_drops_the_partial_reply_too() {
        let items: Vec<ChatResult<String>> = vec![
            Ok("Wa".to_string()),
            Err(ChatError::transport(None, "overloaded"))
        ];
        let deltas: DeltaStream = Box::pin(stream::iter(items));
        let client = FakeClient::new(Ok(deltas));
        let agent = ChatAgent::new(client, None, AgentOptions::default());
        let (tx, _rx) = unbounded_channel();
        let mut transcript = Transcript::new();

        assert!(agent.send(&mut transcript, None, "Hello", &tx).await.is_err());
        assert!(transcript.is_empty());
    }

    #[tokio::test]
    async fn keep_question_policy_leaves_the_question() {
        let client = FakeClient::new(Err(ChatError::transport(Some(500), "boom")));
        let agent = ChatAgent::new(client, None, AgentOptions {
            rollback_policy: RollbackPolicy::KeepQuestion,
            ..AgentOptions::default()
        });
        let (tx, _rx) = unbounded_channel();
        let mut transcript = Transcript::new();

        assert!(agent.send(&mut transcript, None, "Hello", &tx).await.is_err());
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.messages()[0].content, "Hello");
        assert!(!transcript.is_streaming());
    }

    async fn wait_for(rx: &mut UnboundedReceiver<ChatEvent>, deltas: usize) -> Vec<ChatEvent> {
        let mut seen = Vec::new();
        let mut count = 0;
        while let Some(event) = rx.recv().await {
            let is_delta = matches!(event, ChatEvent::Delta { .. });
            let is_started = matches!(event, ChatEvent::Started { .. });
            seen.push(event);
            if is_delta {
                count += 1;
            }
            if (deltas == 0 && is_started) || (deltas > 0 && count == deltas) {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn cancel_before_any_delta_leaves_only_the_question() {
        let store = Arc::new(MemoryHistoryStore::new());
        let conv_id = store.create_conversation("t").await.unwrap();
        let agent = Arc::new(
            ChatAgent::new(FakeClient::stalled(&[]), Some(store.clone()), AgentOptions::default())
        );
        let (tx, mut rx) = unbounded_channel();

        let task_agent = agent.clone();
        let task_conv = conv_id.clone();
        let handle = tokio::spawn(async move {
            let mut transcript = Transcript::new();
            let outcome = task_agent.send(&mut transcript, Some(&task_conv), "Hello", &tx).await;
            (transcript, outcome)
        });

        wait_for(&mut rx, 0).await;
        assert!(agent.is_busy());
        agent.cancel();
        let (transcript, outcome) = handle.await.unwrap();

        assert_eq!(outcome.unwrap(), SendOutcome::Stopped);
        assert_eq!(transcript.len(), 1);
        assert!(!transcript.is_streaming());
        assert!(!agent.is_busy());
        assert_eq!(rx.recv().await, Some(ChatEvent::Stopped));

        let stored = store.load_conversation(&conv_id).await.unwrap();
        assert_eq!(stored.messages.len(), 1);
    }

    #[tokio::test]
    async fn cancel_after_deltas_keeps_partial_text_without_persisting_it() {
        let store = Arc::new(MemoryHistoryStore::new());
        let conv_id = store.create_conversation("t").await.unwrap();
        let client = FakeClient::stalled(&["Wa", "'alaykum"]);
        let agent = Arc::new(ChatAgent::new(client, Some(store.clone()), AgentOptions::default()));
        let (tx, mut rx) = unbounded_channel();

        let task_agent = agent.clone();
        let task_conv = conv_id.clone();
        let handle = tokio::spawn(async move {
            let mut transcript = Transcript::new();
            let outcome = task_agent.send(&mut transcript, Some(&task_conv), "Salam", &tx).await;
            (transcript, outcome)
        });

        wait_for(&mut rx, 2).await;
        agent.cancel();
        agent.cancel();
        let (transcript, outcome) = handle.await.unwrap();

        assert_eq!(outcome.unwrap(), SendOutcome::Stopped);
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.messages()[1].content, "Wa'alaykum");
        let remaining = drain(&mut rx);
        assert_eq!(remaining, vec![ChatEvent::Stopped]);

        let stored = store.load_conversation(&conv_id).await.unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].role, Role::User);

        agent.cancel();
        assert!(!agent.is_busy());
    }

    #[tokio::test]
    async fn deltas_arriving_after_cancel_are_ignored() {
        let (feed, feed_rx) = unbounded_channel::<ChatResult<String>>();
        let deltas: DeltaStream = Box::pin(UnboundedReceiverStream::new(feed_rx));
        let agent = Arc::new(ChatAgent::new(FakeClient::new(Ok(deltas)), None, AgentOptions::default()));
        let (tx, mut rx) = unbounded_channel();

        let task_agent = agent.clone();
        let handle = tokio::spawn(async move {
            let mut transcript = Transcript::new();
            let outcome = task_agent.send(&mut transcript, None, "Salam", &tx).await;
            (transcript, outcome)
        });

        feed.send(Ok("a".to_string())).unwrap();
        feed.send(Ok("b".to_string())).unwrap();
        wait_for(&mut rx, 2).await;
        agent.cancel();
        let _ = feed.send(Ok("c".to_string()));
        let _ = feed.send(Ok("d".to_string()));
        let (transcript, outcome) = handle.await.unwrap();

        assert_eq!(outcome.unwrap(), SendOutcome::Stopped);
        assert_eq!(transcript.messages()[1].content, "ab");
        assert_eq!(drain(&mut rx), vec![ChatEvent::Stopped]);
    }

    #[tokio::test]
    async fn cancel_between_reserve_and_send_stops_before_the_request() {
        let client = FakeClient::deltas(&["never"]);
        let agent = ChatAgent::new(client.clone(), None, AgentOptions::default());
        let (tx, mut rx) = unbounded_channel();
        let mut transcript = Transcript::new();

        let reservation = agent.reserve().unwrap();
        assert!(agent.is_busy());
        assert_eq!(agent.send(&mut Transcript::new(), None, "other", &tx).await, Err(ChatError::Busy));

        agent.cancel();
        assert!(reservation.is_cancelled());
        let outcome = agent.send_reserved(reservation, &mut transcript, None, "Hello", &tx).await;

        assert_eq!(outcome.unwrap(), SendOutcome::Stopped);
        assert_eq!(transcript.len(), 1);
        assert!(!transcript.is_streaming());
        assert!(client.requests.lock().unwrap().is_empty());
        assert_eq!(drain(&mut rx).last(), Some(&ChatEvent::Stopped));
        assert!(!agent.is_busy());
    }

    #[tokio::test]
    async fn dropped_reservation_frees_the_slot() {
        let agent = ChatAgent::new(FakeClient::deltas(&["ok"]), None, AgentOptions::default());
        let reservation = agent.reserve().unwrap();
        assert!(matches!(agent.reserve(), Err(ChatError::Busy)));
        drop(reservation);
        assert!(!agent.is_busy());

        let other = ChatAgent::new(FakeClient::deltas(&["ok"]), None, AgentOptions::default());
        let foreign = other.reserve().unwrap();
        let (tx, _rx) = unbounded_channel();
        let mut transcript = Transcript::new();
        let result = agent.send_reserved(foreign, &mut transcript, None, "Hello", &tx).await;
        assert_eq!(result, Err(ChatError::Busy));
        assert!(transcript.is_empty());
        assert!(!other.is_busy());
    }

    #[tokio::test]
    async fn persistence_failure_does_not_touch_the_transcript() {
        let agent = ChatAgent::new(
            FakeClient::deltas(&["Wal", "ailaikum"]),
            Some(Arc::new(FailingStore)),
            AgentOptions::default()
        );
        let (tx, mut rx) = unbounded_channel();
        let mut transcript = Transcript::new();

        let outcome = agent.send(&mut transcript, Some("c1"), "Hello", &tx).await.unwrap();

        assert!(matches!(outcome, SendOutcome::Completed { message: Some(_) }));
        assert_eq!(transcript.len(), 2);
        let failures = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ChatEvent::PersistenceFailed { .. }))
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn empty_reply_is_finished_without_a_message() {
        let agent = ChatAgent::new(FakeClient::deltas(&[]), None, AgentOptions::default());
        let (tx, mut rx) = unbounded_channel();
        let mut transcript = Transcript::new();

        let outcome = agent.send(&mut transcript, None, "Hello", &tx).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed { message: None });
        assert_eq!(transcript.len(), 1);
        assert_eq!(drain(&mut rx).last(), Some(&ChatEvent::Finished { message: None }));
    }

    #[tokio::test]
    async fn second_send_while_in_flight_is_busy() {
        let agent = Arc::new(
            ChatAgent::new(FakeClient::stalled(&[]), None, AgentOptions::default())
        );
        let (tx, mut rx) = unbounded_channel();

        let task_agent = agent.clone();
        let task_tx = tx.clone();
        let handle = tokio::spawn(async move {
            let mut transcript = Transcript::new();
            task_agent.send(&mut transcript, None, "first", &task_tx).await
        });
        wait_for(&mut rx, 0).await;

        let mut other = Transcript::new();
        let err = agent.send(&mut other, None, "second", &tx).await.unwrap_err();
        assert_eq!(err, ChatError::Busy);
        assert!(other.is_empty());

        agent.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), SendOutcome::Stopped);
    }

    #[tokio::test]
    async fn streaming_transcript_is_busy_and_releases_the_slot() {
        let agent = ChatAgent::new(FakeClient::deltas(&["ok"]), None, AgentOptions::default());
        let (tx, _rx) = unbounded_channel();
        let mut transcript = Transcript::new();
        transcript.begin_streaming().unwrap();

        let err = agent.send(&mut transcript, None, "Hello", &tx).await.unwrap_err();
        assert_eq!(err, ChatError::Busy);
        assert!(transcript.is_empty());
        assert!(!agent.is_busy());

        transcript.end_streaming();
        assert!(agent.send(&mut transcript, None, "Hello", &tx).await.is_ok());
    }

    #[test]
    fn session_states_only_move_forward() {
        let mut session = StreamSession::new(CancellationToken::new());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.advance(SessionState::Finalized));
        assert!(session.advance(SessionState::Sending));
        assert!(session.advance(SessionState::Streaming));
        assert!(session.advance(SessionState::Cancelled));
        assert!(session.state().is_terminal());
        assert!(!session.advance(SessionState::Errored));
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[test]
    fn parses_rollback_policies() {
        assert_eq!("remove".parse::<RollbackPolicy>(), Ok(RollbackPolicy::RemoveQuestion));
        assert_eq!("KEEP".parse::<RollbackPolicy>(), Ok(RollbackPolicy::KeepQuestion));
        assert!("mark_failed".parse::<RollbackPolicy>().is_err());
    }
}
