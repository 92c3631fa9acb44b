use crate::history::{ HistoryError, HistoryStore, DEFAULT_TITLE };
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    routing::get,
    Router,
    extract::{ Path, State },
    response::{ IntoResponse, Response },
    http::StatusCode,
    Json,
};
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, error, warn };

#[derive(Deserialize)]
pub struct CreateConversationRequest {
    pub title: Option<String>,
}

#[derive(Serialize)]
struct CreateConversationResponse {
    id: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    history: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    message: String,
}

#[derive(Clone)]
struct AppState {
    history: Option<Arc<dyn HistoryStore>>,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(ErrorResponse { success: false, message: message.into() })).into_response()
}

fn history_error_response(err: HistoryError) -> Response {
    match err {
        HistoryError::NotFound(_) => error_response(StatusCode::NOT_FOUND, err.to_string()),
        _ => {
            error!("History store error: {}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

pub fn router(history: Option<Arc<dyn HistoryStore>>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/conversations", axum::routing::post(create_conversation_handler))
        .route("/api/conversations/{id}", get(get_conversation_handler))
        .layer(cors)
        .with_state(AppState { history })
}

pub async fn start_http_server(
    http_port: u16,
    history: Option<Arc<dyn HistoryStore>>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app = router(history);
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    error!("HTTP server error: {}", e);
                }
            }
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
            }
        }
    });

    info!("HTTP server started");
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        history: state.history.is_some(),
    })
}

async fn get_conversation_handler(
    State(state): State<AppState>,
    Path(id): Path<String>
) -> Response {
    let Some(store) = state.history else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Chat history is disabled");
    };
    match store.load_conversation(&id).await {
        Ok(conversation) => Json(conversation).into_response(),
        Err(e) => history_error_response(e),
    }
}

async fn create_conversation_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>
) -> Response {
    let Some(store) = state.history else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Chat history is disabled");
    };
    let title = req.title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TITLE);
    match store.create_conversation(title).await {
        Ok(id) => {
            info!("Created conversation {} via HTTP API", id);
            (StatusCode::CREATED, Json(CreateConversationResponse { id })).into_response()
        }
        Err(e) => {
            warn!("Failed to create conversation: {}", e);
            history_error_response(e)
        }
    }
}
