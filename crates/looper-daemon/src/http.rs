use crate::core::CoreEvent;
use crate::logging::LogBuffer;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use looper_proto::protocol::{Command, ErrorKind, Reply};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    event_tx: mpsc::Sender<CoreEvent>,
    logs: LogBuffer,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    event_tx: mpsc::Sender<CoreEvent>,
    logs: LogBuffer,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(HttpState { event_tx, logs });

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/command", post(post_command))
        .route("/api/recent", get(list_recent))
        .route("/api/default", get(get_default))
        .route("/api/loops", get(list_loops))
        .route("/api/playlists", get(list_playlists))
        .route("/api/logs", get(get_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InputValidation | ErrorKind::PersistenceValidation => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ErrorKind::DuplicateName | ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PlayerOperation | ErrorKind::ExternalLookup => StatusCode::BAD_GATEWAY,
    }
}

/// Send `command` to the core and wait for its reply.
async fn request(state: &HttpState, command: Command) -> (StatusCode, Json<Reply>) {
    let (reply_tx, reply_rx) = oneshot::channel();
    let event = CoreEvent::Request {
        command,
        reply: reply_tx,
    };
    if state.event_tx.send(event).await.is_err() {
        error!("HTTP API: session core is gone");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Reply::error(ErrorKind::InvalidState, "session is shutting down")),
        );
    }
    match reply_rx.await {
        Ok(reply) => {
            let status = match &reply {
                Reply::Error { kind, .. } => status_for(*kind),
                _ => StatusCode::OK,
            };
            (status, Json(reply))
        }
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Reply::error(ErrorKind::InvalidState, "session dropped the request")),
        ),
    }
}

async fn get_state(State(state): State<HttpState>) -> (StatusCode, Json<Reply>) {
    request(&state, Command::GetState).await
}

async fn post_command(
    State(state): State<HttpState>,
    Json(command): Json<Command>,
) -> (StatusCode, Json<Reply>) {
    info!("HTTP API: {:?}", command);
    request(&state, command).await
}

async fn list_recent(State(state): State<HttpState>) -> (StatusCode, Json<Reply>) {
    request(&state, Command::ListRecent).await
}

async fn get_default(State(state): State<HttpState>) -> (StatusCode, Json<Reply>) {
    request(&state, Command::GetDefault).await
}

async fn list_loops(State(state): State<HttpState>) -> (StatusCode, Json<Reply>) {
    request(&state, Command::ListLoopConfigs).await
}

async fn list_playlists(State(state): State<HttpState>) -> (StatusCode, Json<Reply>) {
    request(&state, Command::ListPlaylists).await
}

async fn get_logs(State(state): State<HttpState>) -> Json<Vec<String>> {
    Json(state.logs.snapshot())
}
