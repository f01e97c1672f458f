//! Route table: one `poem::Route` entry per endpoint of the external
//! interface. Each handler resolves the instance from `AppState.store`,
//! ensures (or reuses) the SSH session via `AppState.ssh`, and delegates
//! to the relevant `core` module.

use std::time::{Duration, Instant};

use poem::http::StatusCode;
use poem::web::websocket::WebSocket;
use poem::web::{Data, Json, Path, Query};
use poem::{Body, Endpoint, IntoResponse, Request, Response, Result, Route, delete, get, post};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::audit::{AuditQuery, DEFAULT_QUERY_LIMIT};
use crate::core::error::CoreError;
use crate::core::models::{AuditEventType, InstanceRef, RecordingDirection};
use crate::core::proxy::{chat, files, http as http_proxy, logs, ws};
use crate::core::ssh::client::exec;
use crate::core::tunnel::manager::well_known_service;

use super::state::AppState;

/// Lets every handler propagate a `CoreError` with `?` straight into a
/// `poem::Error` carrying the right status, and renders the
/// `{detail:"..."}` body the error-kind propagation table requires.
impl poem::error::ResponseError for CoreError {
    fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn as_response(&self) -> Response {
        let body = serde_json::to_string(&json!({ "detail": self.detail() }))
            .unwrap_or_else(|_| "{\"detail\":\"internal error\"}".to_string());
        Response::builder()
            .status(self.status())
            .content_type("application/json")
            .body(Body::from_string(body))
    }
}

async fn load_instance(state: &AppState, id: u64) -> Result<InstanceRef, CoreError> {
    state
        .store
        .get(id)
        .await
        .ok_or_else(|| CoreError::NotFound(format!("instance {id}")))
}

pub fn build_routes() -> Route {
    Route::new()
        .at("/api/v1/instances/:id/ssh-test", get(ssh_test))
        .at("/api/v1/instances/:id/ssh-status", get(ssh_status))
        .at("/api/v1/instances/:id/ssh-reconnect", post(ssh_reconnect))
        .at("/api/v1/instances/:id/ssh-events", get(ssh_events))
        .at("/api/v1/instances/:id/tunnel-status", get(tunnel_status))
        .at("/api/v1/instances/:id/logs", get(logs_sse))
        .at("/api/v1/instances/:id/files", get(files_list))
        .at("/api/v1/instances/:id/files/*rest", get(files_read).put(files_write).post(files_upload))
        .at("/api/v1/instances/:id/terminal", get(terminal_ws))
        .at(
            "/api/v1/instances/:id/terminal/sessions",
            get(terminal_sessions_list),
        )
        .at(
            "/api/v1/instances/:id/terminal/sessions/:sid",
            delete(terminal_session_close),
        )
        .at(
            "/api/v1/instances/:id/terminal/sessions/:sid/recording",
            get(terminal_session_recording),
        )
        .at("/api/v1/instances/:id/desktop/*rest", desktop_proxy_endpoint())
        .at("/api/v1/instances/:id/control/*rest", control_proxy_endpoint())
        .at("/api/v1/instances/:id/chat", get(chat_ws))
        .at("/api/v1/settings/rotate-ssh-key", post(rotate_ssh_key))
        .at("/api/v1/ssh-audit-logs", get(audit_query))
        .at("/api/v1/ssh-audit-logs/purge", post(audit_purge))
}

fn desktop_proxy_endpoint() -> impl Endpoint {
    get(proxy_desktop)
        .post(proxy_desktop)
        .put(proxy_desktop)
        .delete(proxy_desktop)
        .patch(proxy_desktop)
}

fn control_proxy_endpoint() -> impl Endpoint {
    get(proxy_control)
        .post(proxy_control)
        .put(proxy_control)
        .delete(proxy_control)
        .patch(proxy_control)
}

// ---------------------------------------------------------------- ssh-*

#[derive(Serialize)]
struct SshTestResponse {
    status: &'static str,
    output: Option<String>,
    latency_ms: u128,
    error: Option<String>,
}

#[poem::handler]
async fn ssh_test(Path(id): Path<u64>, Data(state): Data<&AppState>) -> Result<Json<serde_json::Value>> {
    let instance = load_instance(state, id).await?;
    let started = Instant::now();

    let result = async {
        let client = state
            .ssh
            .ensure_connected(id, &instance.name, state.orchestrator.clone())
            .await?;
        exec(&client, "echo ok", Duration::from_secs(5))
            .await
            .map_err(CoreError::UpstreamUnreachable)
    }
    .await;

    let latency_ms = started.elapsed().as_millis();
    let response = match result {
        Ok(output) => SshTestResponse {
            status: "ok",
            output: Some(output.stdout.trim().to_string()),
            latency_ms,
            error: None,
        },
        Err(e) => SshTestResponse {
            status: "error",
            output: None,
            latency_ms,
            error: Some(e.detail()),
        },
    };

    Ok(Json(
        serde_json::to_value(response).expect("SshTestResponse always serializes"),
    ))
}

#[poem::handler]
async fn ssh_status(Path(id): Path<u64>, Data(state): Data<&AppState>) -> Result<Json<serde_json::Value>> {
    load_instance(state, id).await?;
    let connection_state = state.ssh.get_connection_state(id).await;
    let metrics = state.ssh.get_metrics(id).await;
    let tunnels = state.tunnels.tunnels_for_instance(id).await;
    let events = state.ssh.get_events(id, 50).await;

    Ok(Json(json!({
        "state": connection_state,
        "metrics": metrics.map(|m| json!({
            "connected_at": m.connected_at,
            "successful_checks": m.successful_checks,
            "failed_checks": m.failed_checks,
        })),
        "tunnels": tunnels,
        "events": events,
    })))
}

#[poem::handler]
async fn ssh_reconnect(Path(id): Path<u64>, Data(state): Data<&AppState>) -> Result<Json<serde_json::Value>> {
    let instance = load_instance(state, id).await?;
    state
        .ssh
        .reconnect(id, &instance.name, state.orchestrator.clone())
        .await?;
    Ok(Json(json!({ "reconnected": true })))
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

#[poem::handler]
async fn ssh_events(
    Path(id): Path<u64>,
    Query(q): Query<EventsQuery>,
    Data(state): Data<&AppState>,
) -> Result<Json<serde_json::Value>> {
    load_instance(state, id).await?;
    let limit = q.limit.unwrap_or(50).min(100);
    let events = state.ssh.get_events(id, limit).await;
    Ok(Json(json!({ "events": events })))
}

#[poem::handler]
async fn tunnel_status(Path(id): Path<u64>, Data(state): Data<&AppState>) -> Result<Json<serde_json::Value>> {
    load_instance(state, id).await?;
    let tunnels = state.tunnels.tunnels_for_instance(id).await;
    Ok(Json(json!({ "tunnels": tunnels })))
}

// ------------------------------------------------------------------ logs

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<u32>,
    follow: Option<bool>,
    #[serde(rename = "type")]
    log_type: Option<String>,
}

#[poem::handler]
async fn logs_sse(
    Path(id): Path<u64>,
    Query(q): Query<LogsQuery>,
    Data(state): Data<&AppState>,
) -> Result<poem::web::sse::SSE> {
    let instance = load_instance(state, id).await?;
    let path = resolve_log_path(&instance, q.log_type.as_deref())?;
    let client = state
        .ssh
        .ensure_connected(id, &instance.name, state.orchestrator.clone())
        .await?;
    let stream = logs::stream_log(&client, &path, q.tail.unwrap_or(200), q.follow.unwrap_or(false))
        .await?;
    Ok(poem::web::sse::SSE::new(stream))
}

fn resolve_log_path(instance: &InstanceRef, log_type: Option<&str>) -> Result<String, CoreError> {
    match log_type {
        Some(kind) => instance
            .custom_log_paths
            .as_ref()
            .and_then(|m| m.get(kind))
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("no log path registered for {kind}"))),
        None => Ok("/var/log/agent/stdout.log".to_string()),
    }
}

// ----------------------------------------------------------------- files

#[derive(Deserialize)]
struct FilesListQuery {
    path: String,
}

#[poem::handler]
async fn files_list(
    Path(id): Path<u64>,
    Query(q): Query<FilesListQuery>,
    Data(state): Data<&AppState>,
) -> Result<Json<serde_json::Value>> {
    let instance = load_instance(state, id).await?;
    let client = state
        .ssh
        .ensure_connected(id, &instance.name, state.orchestrator.clone())
        .await?;
    let sftp = files::open_sftp(&client).await?;
    let entries = files::list_dir(&sftp, &q.path).await?;
    Ok(Json(json!({ "entries": entries })))
}

#[poem::handler]
async fn files_read(
    Path((id, rest)): Path<(u64, String)>,
    Data(state): Data<&AppState>,
) -> Result<Vec<u8>> {
    let instance = load_instance(state, id).await?;
    let client = state
        .ssh
        .ensure_connected(id, &instance.name, state.orchestrator.clone())
        .await?;
    let sftp = files::open_sftp(&client).await?;
    let path = format!("/{rest}");
    let bytes = files::read_file(&sftp, &path).await?;
    Ok(bytes)
}

#[poem::handler]
async fn files_write(
    Path((id, rest)): Path<(u64, String)>,
    body: Body,
    Data(state): Data<&AppState>,
) -> Result<Json<serde_json::Value>> {
    let instance = load_instance(state, id).await?;
    let client = state
        .ssh
        .ensure_connected(id, &instance.name, state.orchestrator.clone())
        .await?;
    let sftp = files::open_sftp(&client).await?;
    let path = format!("/{rest}");
    let contents = body
        .into_vec()
        .await
        .map_err(|e| CoreError::InvalidInput(format!("reading request body: {e}")))?;

    if path.ends_with('/') {
        files::make_dir(&sftp, path.trim_end_matches('/')).await?;
    } else {
        files::write_file(&sftp, &path, &contents).await?;
    }

    state
        .audit
        .record(id, &instance.name, AuditEventType::FileOp, "dev-operator", None, &path)
        .await;

    Ok(Json(json!({ "written": path })))
}

/// Multipart upload: one or more file fields, each written to `rest`
/// (treated as a directory, the field's own filename supplies the leaf
/// name) or, if `rest` names a single file directly, to that path.
#[poem::handler]
async fn files_upload(
    Path((id, rest)): Path<(u64, String)>,
    mut multipart: poem::web::Multipart,
    Data(state): Data<&AppState>,
) -> Result<Json<serde_json::Value>> {
    let instance = load_instance(state, id).await?;
    let client = state
        .ssh
        .ensure_connected(id, &instance.name, state.orchestrator.clone())
        .await?;
    let sftp = files::open_sftp(&client).await?;
    let base_path = format!("/{rest}");

    let mut written = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CoreError::InvalidInput(format!("reading multipart field: {e}")))?
    {
        let file_name = field.file_name().map(ToString::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| CoreError::InvalidInput(format!("reading multipart body: {e}")))?;

        let target = if base_path.ends_with('/') {
            let file_name = file_name.ok_or_else(|| {
                CoreError::InvalidInput("multipart field is missing a filename".to_string())
            })?;
            format!("{base_path}{file_name}")
        } else {
            base_path.clone()
        };

        files::upload(&sftp, &target, &bytes).await?;
        written.push(target);
    }

    state
        .audit
        .record(id, &instance.name, AuditEventType::FileOp, "dev-operator", None, &written.join(", "))
        .await;

    Ok(Json(json!({ "written": written })))
}

// -------------------------------------------------------------- terminal

#[derive(Deserialize)]
struct TerminalQuery {
    shell: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
    record: Option<bool>,
}

#[poem::handler]
async fn terminal_ws(
    Path(id): Path<u64>,
    Query(q): Query<TerminalQuery>,
    Data(state): Data<&AppState>,
    ws: WebSocket,
) -> Result<impl IntoResponse> {
    let instance = load_instance(state, id).await?;
    let client = state
        .ssh
        .ensure_connected(id, &instance.name, state.orchestrator.clone())
        .await?;

    let shell = q.shell.unwrap_or_else(|| "/bin/bash".to_string());
    let cols = q.cols.unwrap_or(80);
    let rows = q.rows.unwrap_or(24);
    let record = q.record.unwrap_or(false);

    let terminals = state.terminals.clone();
    let max_input = state.settings.max_input_message_size;
    let session = terminals
        .open(id, "dev-operator", &shell, cols, rows, record, client)
        .await?;

    Ok(ws.on_upgrade(move |socket| async move {
        use futures::{SinkExt, StreamExt};
        use poem::web::websocket::Message;

        let (mut sink, mut stream) = socket.split();
        let mut output_rx = session.output_tx.subscribe();
        let session_id = session.info.read().await.id.clone();

        {
            let info = session.info.read().await;
            let greeting = TerminalGreeting {
                session_id: &info.id,
                cols: info.cols,
                rows: info.rows,
                recording: info.recording,
            };
            if let Ok(text) = serde_json::to_string(&greeting) {
                let _ = sink.send(Message::Text(text)).await;
            }
        }

        loop {
            tokio::select! {
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<InboundTerminalFrame>(&text) {
                                Ok(InboundTerminalFrame::Resize { cols, rows }) => {
                                    if let Err(e) = terminals.resize(&session_id, cols, rows).await {
                                        tracing::debug!("terminal resize failed for {session_id}: {e}");
                                    }
                                }
                                Ok(InboundTerminalFrame::Input { data }) => {
                                    if data.len() > max_input {
                                        continue;
                                    }
                                    if !session.rate_limiter.allow() {
                                        continue;
                                    }
                                    session.record(RecordingDirection::Input, data.as_bytes()).await;
                                    if session
                                        .channel_writer
                                        .lock()
                                        .await
                                        .write(data.as_bytes())
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                Err(_) => {
                                    tracing::debug!("dropping malformed terminal frame");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
                output = output_rx.recv() => {
                    match output {
                        Ok(data) => {
                            if sink.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        }
        let _ = sink.close().await;
    }))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundTerminalFrame {
    Resize { cols: u16, rows: u16 },
    Input { data: String },
}

#[derive(Serialize)]
struct TerminalGreeting<'a> {
    #[serde(rename = "sessionId")]
    session_id: &'a str,
    cols: u16,
    rows: u16,
    recording: bool,
}

#[derive(Deserialize)]
struct TerminalSessionsQuery {
    active: Option<bool>,
}

#[poem::handler]
async fn terminal_sessions_list(
    Path(id): Path<u64>,
    Query(q): Query<TerminalSessionsQuery>,
    Data(state): Data<&AppState>,
) -> Result<Json<serde_json::Value>> {
    load_instance(state, id).await?;
    let sessions = state
        .terminals
        .list_sessions(id, q.active.unwrap_or(false))
        .await;
    Ok(Json(json!({ "sessions": sessions })))
}

#[poem::handler]
async fn terminal_session_close(
    Path((id, sid)): Path<(u64, String)>,
    Data(state): Data<&AppState>,
) -> Result<Json<serde_json::Value>> {
    load_instance(state, id).await?;
    state.terminals.close_session(&sid).await?;
    Ok(Json(json!({ "closed": sid })))
}

#[poem::handler]
async fn terminal_session_recording(
    Path((id, sid)): Path<(u64, String)>,
    Data(state): Data<&AppState>,
) -> Result<Json<serde_json::Value>> {
    load_instance(state, id).await?;
    let session = state
        .terminals
        .get(&sid)
        .ok_or_else(|| CoreError::NotFound(format!("terminal session {sid}")))?;
    let recording = session.export_recording().await;
    Ok(Json(json!({ "recording": recording })))
}

// ----------------------------------------------------------- proxy mounts

async fn resolve_proxy_port(
    state: &AppState,
    id: u64,
    service: &str,
) -> Result<(u16, InstanceRef), CoreError> {
    let instance = load_instance(state, id).await?;
    let client = state
        .ssh
        .ensure_connected(id, &instance.name, state.orchestrator.clone())
        .await?;
    well_known_service(service)
        .ok_or_else(|| CoreError::InvalidInput(format!("unknown service {service}")))?;
    let forward_routes = state
        .ssh
        .forward_routes(id)
        .await
        .unwrap_or_else(crate::core::ssh::handler::new_forward_routes);
    let tunnel = state
        .tunnels
        .ensure_tunnel(id, service, client, forward_routes)
        .await?;
    Ok((tunnel.local_port, instance))
}

fn is_websocket_upgrade(req: &Request) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Whether the client sent an `Accept` header naming `text/html` — the
/// signal that this is a browser navigation rather than an API/XHR
/// call, which decides whether an unreachable backend gets the HTML
/// placeholder body or a plain JSON error.
fn accepts_html(req: &Request) -> bool {
    req.headers()
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false)
}

async fn proxy_service(
    id: u64,
    rest: String,
    state: &AppState,
    req: &Request,
    ws: WebSocket,
    body: Body,
    service: &str,
) -> Result<Response> {
    let upgrade = is_websocket_upgrade(req);
    let (local_port, _instance) = resolve_proxy_port(state, id, service).await?;

    if upgrade {
        let backend_url = format!("ws://127.0.0.1:{local_port}/{rest}");
        let read_limit = state.settings.ws_read_limit;
        let response = ws.on_upgrade(move |client_ws| async move {
            match tokio_tungstenite::connect_async(&backend_url).await {
                Ok((backend_ws, _)) => {
                    let _ = ws::relay(client_ws, backend_ws, read_limit).await;
                }
                Err(e) => {
                    tracing::warn!("proxy websocket dial to {backend_url} failed: {e}");
                    use futures::SinkExt;
                    use poem::web::websocket::Message;
                    let mut client_ws = client_ws;
                    let _ = client_ws
                        .send(Message::Close(Some((4502, "backend websocket unreachable".to_string()))))
                        .await;
                }
            }
        });
        Ok(response.into_response())
    } else {
        let html = accepts_html(req);
        let method = req.method().to_string();
        let path = format!("/{rest}");
        let headers: Vec<(String, String)> = req
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let bytes = body
            .into_vec()
            .await
            .map_err(|e| CoreError::InvalidInput(format!("reading proxy request body: {e}")))?;

        match http_proxy::forward(local_port, &method, &path, &headers, bytes).await {
            Ok(proxied) => {
                let mut builder = Response::builder().status(
                    StatusCode::from_u16(proxied.status).unwrap_or(StatusCode::BAD_GATEWAY),
                );
                for (name, value) in proxied.headers {
                    builder = builder.header(name, value);
                }
                Ok(builder.body(Body::from(proxied.body)))
            }
            Err(CoreError::UpstreamUnreachable(_)) if html => Ok(Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .header("retry-after", "1")
                .content_type("text/html")
                .body(Body::from_string(
                    http_proxy::connecting_placeholder_html().to_string(),
                ))),
            Err(e) => Err(e.into()),
        }
    }
}

#[poem::handler]
async fn proxy_desktop(
    Path((id, rest)): Path<(u64, String)>,
    Data(state): Data<&AppState>,
    req: &Request,
    ws: WebSocket,
    body: Body,
) -> Result<Response> {
    proxy_service(id, rest, state, req, ws, body, "desktop").await
}

#[poem::handler]
async fn proxy_control(
    Path((id, rest)): Path<(u64, String)>,
    Data(state): Data<&AppState>,
    req: &Request,
    ws: WebSocket,
    body: Body,
) -> Result<Response> {
    proxy_service(id, rest, state, req, ws, body, "control").await
}

// ---------------------------------------------------------------- chat

#[poem::handler]
async fn chat_ws(
    Path(id): Path<u64>,
    Data(state): Data<&AppState>,
    ws: WebSocket,
) -> Result<impl IntoResponse> {
    let instance = load_instance(state, id).await?;
    let client = state
        .ssh
        .ensure_connected(id, &instance.name, state.orchestrator.clone())
        .await?;
    let spec = well_known_service("chat")
        .ok_or_else(|| CoreError::Internal("chat service mapping missing".to_string()))?;
    let tunnels = state.tunnels.clone();
    let remote_port = spec.remote_port;
    let gateway_token = instance.gateway_token.clone();
    let read_limit = state.settings.ws_read_limit;

    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(e) = chat::relay(socket, &client, &tunnels, remote_port, gateway_token.as_deref(), read_limit).await {
            tracing::warn!("chat relay for instance {id} ended: {e}");
        }
    }))
}

// --------------------------------------------------------------- rotation

#[poem::handler]
async fn rotate_ssh_key(Data(state): Data<&AppState>) -> Result<Json<serde_json::Value>> {
    let report = state.rotation.rotate(state.orchestrator.as_ref()).await?;
    Ok(Json(json!({
        "fingerprint": report.fingerprint,
        "oldFingerprint": report.old_fingerprint,
        "timestamp": report.timestamp,
        "all_succeeded": report.all_succeeded(),
        "probes": report.probes.iter().map(|p| json!({
            "instance_id": p.instance_id,
            "name": p.name,
            "ok": p.ok,
            "detail": p.detail,
        })).collect::<Vec<_>>(),
    })))
}

// ----------------------------------------------------------------- audit

#[derive(Deserialize)]
struct AuditQueryParams {
    instance_id: Option<u64>,
    #[serde(rename = "instanceName")]
    instance_name: Option<String>,
    event_type: Option<String>,
    username: Option<String>,
    until: Option<chrono::DateTime<chrono::Utc>>,
    limit: Option<usize>,
}

#[poem::handler]
async fn audit_query(
    Query(q): Query<AuditQueryParams>,
    Data(state): Data<&AppState>,
) -> Result<Json<serde_json::Value>> {
    let event_type = q.event_type.as_deref().and_then(parse_audit_event_type);
    let events = state
        .audit
        .query(AuditQuery {
            instance_id: q.instance_id,
            instance_name: q.instance_name,
            event_type,
            username: q.username,
            since: None,
            until: q.until,
            limit: q.limit.or(Some(DEFAULT_QUERY_LIMIT)),
        })
        .await;
    Ok(Json(json!({ "events": events })))
}

fn parse_audit_event_type(s: &str) -> Option<AuditEventType> {
    match s {
        "connect" => Some(AuditEventType::Connect),
        "disconnect" => Some(AuditEventType::Disconnect),
        "exec" => Some(AuditEventType::Exec),
        "file_op" => Some(AuditEventType::FileOp),
        "resize" => Some(AuditEventType::Resize),
        "rotation" => Some(AuditEventType::Rotation),
        "health_fail" => Some(AuditEventType::HealthFail),
        _ => None,
    }
}

#[derive(Deserialize)]
struct PurgeBody {
    retention_days: Option<u32>,
}

#[poem::handler]
async fn audit_purge(
    Json(body): Json<PurgeBody>,
    Data(state): Data<&AppState>,
) -> Result<Json<serde_json::Value>> {
    let retention_days = body.retention_days.unwrap_or(state.settings.audit_retention_days);
    let purged = state.audit.purge_older_than(retention_days).await;
    Ok(Json(json!({ "purged": purged })))
}
