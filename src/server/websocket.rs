use crate::agent::{ ChatAgent, ChatEvent, Reservation };
use crate::error::ChatError;
use crate::history::{ conversation_title, DEFAULT_TITLE };
use crate::models::websocket::{ ClientMessage, ServerMessage };
use crate::server::AppContext;
use crate::transcript::Transcript;

use std::error::Error;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{ self, UnboundedSender };

use tokio_tungstenite::{ accept_async, WebSocketStream };
use tokio_tungstenite::tungstenite::protocol::Message;

use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use chrono::Utc;
use futures::{ SinkExt, StreamExt };
use log::{ debug, error, info, warn };

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).unwrap()));
}

/// The conversation a connection is working on.
#[derive(Default)]
struct ConnectionState {
    transcript: Transcript,
    conversation_id: Option<String>,
    /// Created here and still carrying the placeholder title.
    needs_title: bool,
}

pub async fn start_ws_server(
    addr: &str,
    context: AppContext
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!("WS server listening on: {}", addr);
    serve(listener, context).await
}

/// Accepts connections on an already bound listener until it fails.
pub async fn serve(
    listener: TcpListener,
    context: AppContext
) -> Result<(), Box<dyn Error + Send + Sync>> {
    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let context = context.clone();
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => handle_connection(peer, ws, context).await,
                Err(e) => error!("Handshake failed for {}: {}", peer, e),
            }
        });
    }
}

fn send_json(out: &UnboundedSender<Message>, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(json) => {
            if out.send(Message::Text(json)).is_err() {
                debug!("Connection writer closed, dropping {:?}", message);
            }
        }
        Err(e) => error!("Failed to serialize server message: {}", e),
    }
}

fn is_terminal(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Done { .. } | ServerMessage::Stopped | ServerMessage::Error { .. }
    )
}

fn to_server_message(event: ChatEvent) -> ServerMessage {
    match event {
        ChatEvent::Started { .. } => ServerMessage::Processing,
        ChatEvent::Delta { message_id, text } =>
            ServerMessage::Partial { message_id, content: text },
        ChatEvent::Finished { message } =>
            ServerMessage::Done {
                message_id: message.map(|m| m.id),
                timestamp: Utc::now().timestamp(),
            },
        ChatEvent::Stopped => ServerMessage::Stopped,
        ChatEvent::Failed { error } => ServerMessage::Error { message: error.to_string() },
        ChatEvent::PersistenceFailed { error, .. } =>
            ServerMessage::Warning {
                message: format!("Chat history was not saved: {}", error),
            },
    }
}

pub async fn handle_connection<S>(peer: SocketAddr, websocket: WebSocketStream<S>, context: AppContext)
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    info!("New WebSocket connection: {}", peer);

    let (mut sink, mut rx) = websocket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = sink.send(message).await {
                error!("Failed to write to {}: {}", peer, e);
                break;
            }
        }
    });

    let agent = Arc::new(context.new_agent().await);
    let state = Arc::new(Mutex::new(ConnectionState::default()));

    while let Some(msg) = rx.next().await {
        match msg {
            Ok(message) => {
                if message.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds size limit ({} > {})",
                        peer,
                        message.len(),
                        MAX_MESSAGE_SIZE
                    );
                    send_json(&out_tx, &ServerMessage::Error {
                        message: "Message too large".to_string(),
                    });
                    break;
                }

                match message {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_message) => {
                                handle_client_message(
                                    peer,
                                    client_message,
                                    &agent,
                                    &state,
                                    &context,
                                    &out_tx
                                ).await;
                            }
                            Err(e) => {
                                error!("Failed to parse message from {}: {}", peer, e);
                                send_json(&out_tx, &ServerMessage::Error {
                                    message: format!("Failed to parse message: {}", e),
                                });
                            }
                        }
                    }
                    Message::Close(_) => {
                        info!("Received close frame from {}", peer);
                        break;
                    }
                    Message::Ping(ping_data) => {
                        if out_tx.send(Message::Pong(ping_data)).is_err() {
                            error!("Failed to send pong to {}", peer);
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Binary(_) => {
                        warn!("Ignoring binary message from {}", peer);
                    }
                    Message::Frame(_) => {}
                }
            }
            Err(e) => {
                match e {
                    | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::Protocol(_)
                    | tokio_tungstenite::tungstenite::Error::Utf8 => {
                        info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                    }
                    tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                        io_err.kind() == std::io::ErrorKind::ConnectionReset
                    => {
                        info!("WebSocket connection reset by peer {}", peer);
                    }
                    _ => {
                        error!("Error receiving message from {}: {}", peer, e);
                    }
                }
                break;
            }
        }
    }

    agent.cancel();
    drop(out_tx);
    if let Err(e) = writer.await {
        error!("Writer task for {} ended abnormally: {}", peer, e);
    }
    info!("WebSocket connection closed for {}", peer);
}

async fn handle_client_message(
    peer: SocketAddr,
    message: ClientMessage,
    agent: &Arc<ChatAgent>,
    state: &Arc<Mutex<ConnectionState>>,
    context: &AppContext,
    out: &UnboundedSender<Message>
) {
    match message {
        ClientMessage::Chat { content } => {
            if content.trim().is_empty() {
                send_json(out, &ServerMessage::Error { message: "Message is empty".to_string() });
                return;
            }
            // Held until the reply ends, so a second chat is refused instead of queued.
            let Ok(guard) = state.clone().try_lock_owned() else {
                send_json(out, &ServerMessage::Error { message: ChatError::Busy.to_string() });
                return;
            };
            // Claimed here so a stop or a disconnect during conversation setup is not lost.
            let reservation = match agent.reserve() {
                Ok(reservation) => reservation,
                Err(e) => {
                    send_json(out, &ServerMessage::Error { message: e.to_string() });
                    return;
                }
            };
            let agent = agent.clone();
            let context = context.clone();
            let out = out.clone();
            tokio::spawn(async move {
                run_chat(peer, content, agent, reservation, guard, context, out).await;
            });
        }
        ClientMessage::Stop => {
            info!("Stop requested by {}", peer);
            agent.cancel();
        }
        ClientMessage::Load { conversation_id } => {
            let Ok(mut state) = state.try_lock() else {
                send_json(out, &ServerMessage::Error { message: ChatError::Busy.to_string() });
                return;
            };
            let Some(store) = context.history.as_ref() else {
                send_json(out, &ServerMessage::Error {
                    message: "Chat history is disabled".to_string(),
                });
                return;
            };
            match store.load_conversation(&conversation_id).await {
                Ok(conversation) => {
                    info!(
                        "Loaded conversation {} ({} messages) for {}",
                        conversation.id,
                        conversation.messages.len(),
                        peer
                    );
                    state.transcript = Transcript::from_messages(conversation.messages);
                    state.conversation_id = Some(conversation.id.clone());
                    state.needs_title = false;
                    send_json(out, &ServerMessage::Conversation {
                        id: Some(conversation.id),
                        messages: state.transcript.messages().to_vec(),
                    });
                }
                Err(e) => {
                    warn!("Failed to load conversation {} for {}: {}", conversation_id, peer, e);
                    send_json(out, &ServerMessage::Error { message: e.to_string() });
                }
            }
        }
        ClientMessage::New => {
            let Ok(mut state) = state.try_lock() else {
                send_json(out, &ServerMessage::Error { message: ChatError::Busy.to_string() });
                return;
            };
            state.transcript.clear();
            state.conversation_id = None;
            state.needs_title = false;
            send_json(out, &ServerMessage::Conversation { id: None, messages: Vec::new() });
        }
    }
}

async fn run_chat(
    peer: SocketAddr,
    content: String,
    agent: Arc<ChatAgent>,
    reservation: Reservation,
    mut guard: tokio::sync::OwnedMutexGuard<ConnectionState>,
    context: AppContext,
    out: UnboundedSender<Message>
) {
    if guard.conversation_id.is_none() {
        if let Some(store) = context.history.as_ref() {
            // The real title is set once the first question is known to stay.
            match store.create_conversation(DEFAULT_TITLE).await {
                Ok(id) => {
                    info!("Started conversation {} for {}", id, peer);
                    send_json(&out, &ServerMessage::Conversation {
                        id: Some(id.clone()),
                        messages: guard.transcript.messages().to_vec(),
                    });
                    guard.conversation_id = Some(id);
                    guard.needs_title = true;
                }
                Err(e) => {
                    warn!("Could not create a conversation for {}: {}", peer, e);
                    send_json(&out, &ServerMessage::Warning {
                        message: format!("Chat history was not saved: {}", e),
                    });
                }
            }
        }
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ChatEvent>();
    let forward_out = out.clone();
    // Done, stopped and error go out only after the connection is free again.
    let forwarder = tokio::spawn(async move {
        let mut terminal = None;
        while let Some(event) = events_rx.recv().await {
            let message = to_server_message(event);
            if is_terminal(&message) {
                terminal = Some(message);
            } else {
                send_json(&forward_out, &message);
            }
        }
        terminal
    });

    let session = &mut *guard;
    let result = agent.send_reserved(
        reservation,
        &mut session.transcript,
        session.conversation_id.as_deref(),
        &content,
        &events_tx
    ).await;
    drop(events_tx);

    if guard.needs_title {
        set_title(&mut guard, &context).await;
    }

    let terminal = match forwarder.await {
        Ok(terminal) => terminal,
        Err(e) => {
            error!("Event forwarder for {} ended abnormally: {}", peer, e);
            None
        }
    };
    drop(guard);
    if let Some(message) = terminal {
        send_json(&out, &message);
    }

    match result {
        Ok(outcome) => debug!("Chat for {} ended: {:?}", peer, outcome),
        Err(ChatError::Busy) => {
            send_json(&out, &ServerMessage::Error { message: ChatError::Busy.to_string() });
        }
        Err(e) => debug!("Chat for {} failed: {}", peer, e),
    }
}

/// Names the conversation after its first question once that question survived a send.
async fn set_title(state: &mut ConnectionState, context: &AppContext) {
    let (Some(id), Some(store)) = (state.conversation_id.as_deref(), context.history.as_ref()) else {
        return;
    };
    let Some(first) = state.transcript.messages().first() else {
        return;
    };
    let title = conversation_title(&first.content);
    match store.rename_conversation(id, &title).await {
        Ok(()) => {
            debug!("Conversation {} titled '{}'", id, title);
            state.needs_title = false;
        }
        Err(e) => warn!("Could not set the title of conversation {}: {}", id, e),
    }
}
