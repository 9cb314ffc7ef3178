//! Web API
//!
//! Thin HTTP/WebSocket layer over [`Commander`]. Calls that touch the
//! Command Channel or wait on processes run on the blocking pool.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use parol_control::{
    Commander, CommanderStatus, ControlError, JogIntent, JogMode, OutputStream, ProgramEntry,
    ProgramRunSnapshot, RobotAction, RunId, TelemetryEvent,
};
use parol_driver::DriverError;
use parol_protocol::Telemetry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// How long a bridge thread waits before checking whether its socket is gone.
const BRIDGE_WAIT: Duration = Duration::from_millis(250);

pub struct AppState {
    pub commander: Arc<Commander>,
}

/// JSON error body `{code, message}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let (status, code) = match &err {
            ControlError::NotFound(_) | ControlError::UnknownRun(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            },
            ControlError::AlreadyRunning(_) => (StatusCode::CONFLICT, "already_running"),
            ControlError::Driver(DriverError::NotOwner { .. } | DriverError::AlreadyClaimed) => {
                (StatusCode::CONFLICT, "not_owner")
            },
            ControlError::NotReady(_) => (StatusCode::SERVICE_UNAVAILABLE, "not_ready"),
            ControlError::Driver(e) if e.is_link_failure() => {
                (StatusCode::SERVICE_UNAVAILABLE, "unreachable")
            },
            ControlError::InvalidConfig(_) | ControlError::InvalidName(_) => {
                (StatusCode::BAD_REQUEST, "invalid")
            },
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self::new(status, code, err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code,
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run `f` on the blocking pool.
async fn blocking<T, F>(state: &AppState, f: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Commander) -> Result<T, ControlError> + Send + 'static,
{
    let commander = state.commander.clone();
    tokio::task::spawn_blocking(move || f(&commander))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(ApiError::from)
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status))
        .route("/api/jog", post(jog))
        .route("/api/jog/release", post(jog_release))
        .route("/api/jog/ws", get(jog_ws))
        .route("/api/robot/:action", post(robot_action))
        .route("/api/controller/ensure", post(controller_ensure))
        .route("/api/controller/port", post(controller_port))
        .route("/api/programs", get(list_programs))
        .route(
            "/api/programs/files/:name",
            get(load_program).put(save_program),
        )
        .route("/api/programs/start", post(start_program))
        .route("/api/programs/current", get(current_program))
        .route("/api/programs/:id/stop", post(stop_program))
        .route("/api/programs/:id/output", get(program_output))
        .route("/api/telemetry/ws", get(telemetry_ws))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<Arc<AppState>>) -> Json<CommanderStatus> {
    Json(state.commander.status())
}

#[derive(Debug, Deserialize)]
struct JogRequest {
    #[serde(flatten)]
    mode: JogMode,
    /// Signed percent of max speed per axis.
    values: [f64; 6],
}

impl JogRequest {
    fn into_intent(self) -> JogIntent {
        JogIntent::new(self.mode, self.values)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Submitted {
    sequence: u64,
}

async fn jog(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JogRequest>,
) -> ApiResult<Json<Submitted>> {
    let sequence = state.commander.submit_jog(req.into_intent())?;
    Ok(Json(Submitted { sequence }))
}

async fn jog_release(State(state): State<Arc<AppState>>) -> Json<Submitted> {
    Json(Submitted {
        sequence: state.commander.release_jog(),
    })
}

/// Hold-to-jog: every text frame is a [`JogRequest`]; closing releases.
async fn jog_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| jog_connection(state, socket))
}

async fn jog_connection(state: Arc<AppState>, mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else {
            continue;
        };
        match serde_json::from_str::<JogRequest>(&text) {
            Ok(req) => {
                if let Err(e) = state.commander.submit_jog(req.into_intent()) {
                    debug!(error = %e, "jog rejected");
                }
            },
            Err(e) => debug!(error = %e, "bad jog frame"),
        }
    }
    state.commander.release_jog();
}

#[derive(Debug, Serialize)]
struct ActionDone {
    action: RobotAction,
}

async fn robot_action(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
) -> ApiResult<Json<ActionDone>> {
    let action: RobotAction = action.parse()?;
    blocking(&state, move |c| c.robot_action(action)).await?;
    Ok(Json(ActionDone { action }))
}

#[derive(Debug, Serialize)]
struct ControllerStateBody {
    state: &'static str,
}

async fn controller_ensure(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ControllerStateBody>> {
    let controller = blocking(&state, |c| c.ensure_controller()).await?;
    Ok(Json(ControllerStateBody {
        state: controller.name(),
    }))
}

#[derive(Debug, Deserialize)]
struct PortRequest {
    port: String,
}

async fn controller_port(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PortRequest>,
) -> ApiResult<StatusCode> {
    blocking(&state, move |c| c.set_com_port(&req.port)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_programs(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ProgramEntry>>> {
    let programs = blocking(&state, |c| c.library().list()).await?;
    Ok(Json(programs))
}

async fn load_program(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let text = blocking(&state, move |c| c.library().load(&name)).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response())
}

async fn save_program(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: String,
) -> ApiResult<StatusCode> {
    blocking(&state, move |c| c.library().save(&name, &body)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    name: String,
}

async fn start_program(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> ApiResult<(StatusCode, Json<ProgramRunSnapshot>)> {
    let run = blocking(&state, move |c| {
        let path = c.library().path_of(&req.name)?;
        let id = c.runner().start(path)?;
        c.runner()
            .current()
            .filter(|run| run.id == id)
            .ok_or(ControlError::UnknownRun(id))
    })
    .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn current_program(
    State(state): State<Arc<AppState>>,
) -> Json<Option<ProgramRunSnapshot>> {
    Json(state.commander.runner().current())
}

async fn stop_program(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> ApiResult<Json<ProgramRunSnapshot>> {
    let run = blocking(&state, move |c| c.runner().stop(RunId(id))).await?;
    Ok(Json(run))
}

async fn program_output(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let stream = state.commander.runner().subscribe(RunId(id))?;
    Ok(ws.on_upgrade(move |socket| output_connection(socket, stream)))
}

/// Forward output lines until the run ends or the client leaves.
async fn output_connection(socket: WebSocket, stream: OutputStream) {
    let (tx, rx) = mpsc::channel::<String>(256);
    tokio::task::spawn_blocking(move || {
        loop {
            match stream.next_timeout(BRIDGE_WAIT) {
                Ok(line) => {
                    if tx.blocking_send(line.to_string()).is_err() {
                        break;
                    }
                },
                Err(e) if e.is_timeout() => {
                    if tx.is_closed() {
                        break;
                    }
                },
                Err(_) => break,
            }
        }
    });
    forward(socket, rx).await;
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TelemetryMessage<'a> {
    Snapshot {
        telemetry: &'a Telemetry,
    },
    Unreachable {
        consecutive_failures: u32,
        error: &'a str,
    },
}

fn telemetry_json(event: &TelemetryEvent) -> Option<String> {
    let msg = match event {
        TelemetryEvent::Snapshot { telemetry, .. } => TelemetryMessage::Snapshot { telemetry },
        TelemetryEvent::Unreachable {
            consecutive_failures,
            error,
        } => TelemetryMessage::Unreachable {
            consecutive_failures: *consecutive_failures,
            error,
        },
    };
    serde_json::to_string(&msg).ok()
}

async fn telemetry_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| telemetry_connection(state, socket))
}

async fn telemetry_connection(state: Arc<AppState>, socket: WebSocket) {
    let observer = state.commander.telemetry().clone();
    let events = observer.subscribe();
    let (tx, rx) = mpsc::channel::<String>(16);
    if let Some(text) = observer.latest().as_deref().and_then(telemetry_json) {
        if let Err(e) = tx.send(text).await {
            debug!(error = %e, "telemetry bridge closed before first event");
        }
    }
    tokio::task::spawn_blocking(move || {
        loop {
            match events.recv_timeout(BRIDGE_WAIT) {
                Ok(event) => {
                    let Some(text) = telemetry_json(&event) else {
                        continue;
                    };
                    if tx.blocking_send(text).is_err() {
                        break;
                    }
                },
                Err(e) if e.is_timeout() => {
                    if tx.is_closed() {
                        break;
                    }
                },
                Err(_) => break,
            }
        }
    });
    forward(socket, rx).await;
}

/// Pump `rx` into the socket; returns when either side is done.
async fn forward(socket: WebSocket, mut rx: mpsc::Receiver<String>) {
    let (mut sender, mut receiver) = socket.split();
    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        if let Err(e) = sender.send(Message::Close(None)).await {
            debug!(error = %e, "websocket close failed");
        }
    });

    tokio::select! {
        _ = &mut send_task => {},
        _ = async { while let Some(Ok(_)) = receiver.next().await {} } => {
            send_task.abort();
        },
    }
}
