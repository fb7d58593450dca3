//! HTTP surface: dashboard endpoints, MJPEG streams, and the SSE event feed.
//!
//! The server is a plain `TcpListener` accept loop. Every connection gets
//! its own handler thread because stream and event connections are
//! long-lived; short API requests ride the same path and finish quickly.
//! Handlers never touch worker internals directly, only [`AppState`].

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Local;
use std::collections::HashMap;

use crate::annotate;
use crate::detect::Detection;
use crate::frame::ReadOutcome;
use crate::ingest::has_allowed_extension;
use crate::jpeg;
use crate::sources::{AddSource, SourceInfo, SourceStatus};
use crate::state::{AppState, SettingsUpdate};
use crate::track::render_report;

const MAX_REQUEST_BYTES: usize = 8192;

/// Multipart boundary token for MJPEG responses.
const MJPEG_BOUNDARY: &str = "frame";

/// Pause between buffer polls while a stream connection waits for a frame
/// newer than its cursor.
const STREAM_IDLE_POLL: Duration = Duration::from_millis(10);

/// Cadence of placeholder frames for a missing or errored source.
const PLACEHOLDER_INTERVAL: Duration = Duration::from_millis(500);

/// Stats heartbeat cadence on an idle event-stream connection.
const SSE_STATS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8870".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting connections and join the accept loop. Connections
    /// already streaming wind down at their next shutdown check.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: Arc<AppState>) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let state = self.state;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, state, shutdown_thread) {
                log::error!("monitor api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, state: Arc<AppState>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let state = state.clone();
                let shutdown = shutdown.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, state, shutdown) {
                        // usually just a client hanging up mid-stream
                        log::debug!("api connection closed: {err:#}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    state: Arc<AppState>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;

    let request = read_request(&mut stream)?;
    route(&mut stream, &request, &state, &shutdown)
}

fn route(
    stream: &mut TcpStream,
    request: &HttpRequest,
    state: &Arc<AppState>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    if let Some((id, flavor)) = stream_route(&request.path) {
        if request.method != "GET" {
            return write_json_response(stream, 405, r#"{"error":"method_not_allowed"}"#);
        }
        return handle_stream(stream, request, state, shutdown, id, flavor);
    }
    if let Some(id) = request.path.strip_prefix("/api/sources/") {
        return match request.method.as_str() {
            "DELETE" if !id.is_empty() && !id.contains('/') => {
                if state.sources.remove(id) {
                    write_json_response(stream, 200, r#"{"success":true}"#)
                } else {
                    write_json_response(stream, 404, r#"{"error":"source_not_found"}"#)
                }
            }
            _ => write_json_response(stream, 405, r#"{"error":"method_not_allowed"}"#),
        };
    }

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(stream, 200, r#"{"status":"ok"}"#),
        ("GET", "/api/stats") => {
            let payload = serde_json::to_vec(&state.sources.dashboard_stats())?;
            write_response(stream, 200, "application/json", &payload)
        }
        ("GET", "/api/sources") => {
            let payload = serde_json::to_vec(&state.sources.summaries())?;
            write_response(stream, 200, "application/json", &payload)
        }
        ("POST", "/api/sources") => handle_add_source(stream, request, state),
        ("GET", "/api/settings") => {
            let payload = serde_json::to_vec(&state.settings.get())?;
            write_response(stream, 200, "application/json", &payload)
        }
        ("POST", "/api/settings") => handle_update_settings(stream, request, state),
        ("GET", "/api/videos") => handle_list_videos(stream, state),
        ("GET", "/events") => handle_event_stream(stream, state, shutdown),
        ("GET", "/report") => handle_report(stream, state),
        (
            _,
            "/health" | "/api/stats" | "/api/sources" | "/api/settings" | "/api/videos"
            | "/events" | "/report",
        ) => write_json_response(stream, 405, r#"{"error":"method_not_allowed"}"#),
        _ => write_json_response(stream, 404, r#"{"error":"not_found"}"#),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamFlavor {
    Raw,
    Annotated,
}

fn stream_route(path: &str) -> Option<(&str, StreamFlavor)> {
    let rest = path.strip_prefix("/sources/")?;
    let (id, tail) = rest.split_once('/')?;
    if id.is_empty() {
        return None;
    }
    match tail {
        "stream" => Some((id, StreamFlavor::Raw)),
        "annotated" => Some((id, StreamFlavor::Annotated)),
        _ => None,
    }
}

fn handle_add_source(
    stream: &mut TcpStream,
    request: &HttpRequest,
    state: &Arc<AppState>,
) -> Result<()> {
    let add: AddSource = match serde_json::from_slice(&request.body) {
        Ok(add) => add,
        Err(err) => {
            return write_json_response(stream, 400, &error_body(&format!("invalid request: {err}")))
        }
    };
    match state.sources.add(add) {
        Ok(info) => {
            let payload = serde_json::to_vec(&info.summary())?;
            write_response(stream, 200, "application/json", &payload)
        }
        Err(err) => write_json_response(stream, 400, &error_body(&format!("{err:#}"))),
    }
}

fn handle_update_settings(
    stream: &mut TcpStream,
    request: &HttpRequest,
    state: &Arc<AppState>,
) -> Result<()> {
    let update: SettingsUpdate = match serde_json::from_slice(&request.body) {
        Ok(update) => update,
        Err(err) => {
            return write_json_response(stream, 400, &error_body(&format!("invalid request: {err}")))
        }
    };
    match state.settings.apply(update) {
        Ok(settings) => {
            log::info!(
                "settings updated: threshold={}, alerts={}",
                settings.confidence_threshold,
                settings.email_alerts
            );
            let payload = serde_json::to_vec(&settings)?;
            write_response(stream, 200, "application/json", &payload)
        }
        Err(err) => write_json_response(stream, 400, &error_body(&format!("{err:#}"))),
    }
}

/// List playable files under the configured video directory. A missing
/// directory is an empty list, not an error.
fn handle_list_videos(stream: &mut TcpStream, state: &Arc<AppState>) -> Result<()> {
    let mut videos: Vec<serde_json::Value> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&state.video_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let location = path.to_string_lossy().to_string();
            if !path.is_file() || !has_allowed_extension(&location) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                videos.push(serde_json::json!({
                    "name": name,
                    "location": location,
                }));
            }
        }
    }
    videos.sort_by(|a, b| {
        a["name"]
            .as_str()
            .unwrap_or_default()
            .cmp(b["name"].as_str().unwrap_or_default())
    });
    let payload = serde_json::to_vec(&videos)?;
    write_response(stream, 200, "application/json", &payload)
}

fn handle_report(stream: &mut TcpStream, state: &Arc<AppState>) -> Result<()> {
    let report = render_report(&state.sources.report_sections(), Local::now());
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nContent-Disposition: attachment; filename=\"ppe_violation_report.txt\"\r\nCache-Control: no-store\r\n\r\n",
        report.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(report.as_bytes())?;
    Ok(())
}

fn handle_stream(
    stream: &mut TcpStream,
    request: &HttpRequest,
    state: &Arc<AppState>,
    shutdown: &Arc<AtomicBool>,
    id: &str,
    flavor: StreamFlavor,
) -> Result<()> {
    let Some(info) = state.sources.get(id) else {
        return write_json_response(stream, 404, r#"{"error":"source_not_found"}"#);
    };

    // Everything that can fail with a clean status code happens before the
    // multipart header goes out.
    let mut detector = None;
    let mut conf_override = None;
    if flavor == StreamFlavor::Annotated {
        let name = request
            .query_param("detector")
            .unwrap_or_else(|| state.detector_name.clone());
        detector = match state.detectors.resolve(&name) {
            Ok(detector) => Some(detector),
            Err(err) => {
                return write_json_response(stream, 400, &error_body(&format!("{err:#}")))
            }
        };
        if let Some(raw) = request.query_param("conf") {
            match raw.parse::<f32>() {
                Ok(conf) if conf > 0.0 && conf <= 1.0 => conf_override = Some(conf),
                _ => {
                    return write_json_response(
                        stream,
                        400,
                        &error_body("conf must be a number within (0, 1]"),
                    )
                }
            }
        }
    }

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(header.as_bytes())?;

    let mut cursor = 0u64;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match info.status() {
            SourceStatus::Inactive => break,
            SourceStatus::Error => {
                write_mjpeg_part(stream, &placeholder_for(&info)?)?;
                std::thread::sleep(PLACEHOLDER_INTERVAL);
                continue;
            }
            SourceStatus::Active => {}
        }
        let frame = match info.buffer.read_at(cursor) {
            ReadOutcome::NotReady => {
                std::thread::sleep(STREAM_IDLE_POLL);
                continue;
            }
            ReadOutcome::Frame {
                frame, next_cursor, ..
            } => {
                cursor = next_cursor;
                frame
            }
        };

        let jpeg = match (&mut detector, flavor) {
            (Some(detector), StreamFlavor::Annotated) => {
                let settings = state.settings.get();
                let threshold = conf_override.unwrap_or(settings.confidence_threshold);
                let detections: Vec<Detection> = match detector.detect(&frame) {
                    Ok(detections) => detections
                        .into_iter()
                        .filter(|d| d.confidence >= threshold)
                        .collect(),
                    Err(err) => {
                        log::warn!(
                            "annotated stream detector failed on frame {}: {err:#}",
                            frame.index
                        );
                        Vec::new()
                    }
                };
                let image = annotate::draw_detections(&frame, &detections)?;
                jpeg::encode_image(&image)?
            }
            _ => jpeg::encode_frame(&frame)?,
        };
        write_mjpeg_part(stream, &jpeg)?;
    }
    Ok(())
}

fn placeholder_for(info: &SourceInfo) -> Result<Vec<u8>> {
    let (width, height) = info
        .buffer
        .latest()
        .map(|frame| (frame.width, frame.height))
        .unwrap_or((640, 480));
    jpeg::placeholder_jpeg(width, height)
}

fn write_mjpeg_part(stream: &mut TcpStream, jpeg: &[u8]) -> Result<()> {
    let head = format!("--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    stream.write_all(head.as_bytes())?;
    stream.write_all(jpeg)?;
    stream.write_all(b"\r\n")?;
    Ok(())
}

/// Server-sent events: a stats snapshot, then the last hour of events
/// oldest-first, then the live tail with stats heartbeats while idle.
fn handle_event_stream(
    stream: &mut TcpStream,
    state: &Arc<AppState>,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    // Subscribe before replaying so nothing published mid-replay is lost.
    let rx = state.broadcaster.subscribe();

    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
    )?;
    write_sse(
        stream,
        "stats",
        &serde_json::to_string(&state.sources.dashboard_stats())?,
    )?;
    for event in state.events.snapshot() {
        write_sse(stream, "detection", &serde_json::to_string(&event)?)?;
    }

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match rx.recv_timeout(SSE_STATS_INTERVAL) {
            Ok(event) => write_sse(stream, "detection", &serde_json::to_string(&event)?)?,
            Err(RecvTimeoutError::Timeout) => write_sse(
                stream,
                "stats",
                &serde_json::to_string(&state.sources.dashboard_stats())?,
            )?,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn write_sse(stream: &mut TcpStream, event: &str, data: &str) -> Result<()> {
    stream.write_all(format!("event: {event}\ndata: {data}\n\n").as_bytes())?;
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let mut header_end = find_blank_line(&data);
    while header_end.is_none() {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        header_end = find_blank_line(&data);
    }
    let header_end = header_end.ok_or_else(|| anyhow!("malformed request"))?;

    let text = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
        if body.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request body too large"));
        }
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query_param(&self, name: &str) -> Option<String> {
        let query = self.raw_path.split('?').nth(1)?;
        for pair in query.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                if k == name {
                    return Some(v.to_string());
                }
            }
        }
        None
    }
}
