use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use engine::{ChallengeService, ScoringStats};
use futures::{SinkExt, StreamExt};
use scoring::HttpScoringClient;
use shared::{
    domain::{Challenge, ChallengeId},
    error::{ApiError, ChallengeError, ErrorCode},
    protocol::{CreateChallengeRequest, JoinChallengeRequest, SubmitRecordingRequest},
};
use storage::{ChallengeRepository, InMemoryChallengeRepository, SqliteChallengeRepository};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, normalize_database_url, Settings};

const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpError = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = load_settings();
    let repo = open_repository(&settings).await?;
    let client = HttpScoringClient::new(&settings.scoring_base_url).with_context(|| {
        format!("invalid scoring base url '{}'", settings.scoring_base_url)
    })?;
    let service = Arc::new(ChallengeService::new(
        repo,
        Arc::new(client),
        settings.correlator(),
    ));

    let app = build_router(Arc::new(AppState {
        service: Arc::clone(&service),
    }));

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.bind_addr))?;
    info!(%addr, scoring = %settings.scoring_base_url, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    info!("server stopped");
    Ok(())
}

async fn open_repository(settings: &Settings) -> anyhow::Result<Arc<dyn ChallengeRepository>> {
    if settings.uses_memory_database() {
        warn!("using in-memory challenge store; state is lost on restart");
        return Ok(Arc::new(InMemoryChallengeRepository::new()));
    }

    let database_url = normalize_database_url(&settings.database_url);
    let repo = SqliteChallengeRepository::new(&database_url)
        .await
        .map_err(|error| {
            error!(
                %database_url,
                %error,
                "failed to open SQLite database; verify parent directory exists and permissions are correct"
            );
            error
        })?;
    info!(%database_url, "challenge store ready");
    Ok(Arc::new(repo))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/challenges", post(create_challenge).get(list_challenges))
        .route("/api/challenges/:id", get(get_challenge))
        .route("/api/challenges/:id/join", post(join_challenge))
        .route("/api/challenges/:id/record", post(submit_recording))
        .route("/api/scoring/stats", get(scoring_stats))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict | ErrorCode::InvalidTurn => StatusCode::CONFLICT,
        ErrorCode::Capacity => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::UpstreamFailure => StatusCode::BAD_GATEWAY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ChallengeError) -> HttpError {
    let status = status_for(err.code());
    if status.is_server_error() {
        warn!(%err, "request failed");
    }
    (status, Json(err.into()))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.service.health_check().await.map_err(reject)?;
    Ok("ok")
}

async fn create_challenge(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateChallengeRequest>,
) -> Result<(StatusCode, Json<Challenge>), HttpError> {
    let challenge = state
        .service
        .create_challenge(req.player_id, &req.username, &req.song_id, &req.song_title)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(challenge)))
}

async fn list_challenges(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Challenge>>, HttpError> {
    let challenges = state.service.list_challenges().await.map_err(reject)?;
    Ok(Json(challenges))
}

async fn get_challenge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Challenge>, HttpError> {
    let challenge = state
        .service
        .get_challenge(&ChallengeId::new(id))
        .await
        .map_err(reject)?;
    Ok(Json(challenge))
}

async fn join_challenge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<JoinChallengeRequest>,
) -> Result<Json<Challenge>, HttpError> {
    let challenge = state
        .service
        .join_challenge(&ChallengeId::new(id), req.player_id, &req.username)
        .await
        .map_err(reject)?;
    Ok(Json(challenge))
}

async fn submit_recording(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SubmitRecordingRequest>,
) -> Result<Json<Challenge>, HttpError> {
    let challenge = state
        .service
        .submit_recording(&ChallengeId::new(id), &req.player_id, &req.audio_url)
        .await
        .map_err(reject)?;
    Ok(Json(challenge))
}

async fn scoring_stats(State(state): State<Arc<AppState>>) -> Json<ScoringStats> {
    Json(state.service.scoring_stats().await)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.service.subscribe());

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "websocket subscriber lagged; events dropped");
                    continue;
                }
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
