use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use stream_core::{
    encode_wav_base64, format_script, load_reference, run_admitted_session, Emission, ExampleScript,
    GenerationRequest, Outcome, SessionReport, SessionUpdate, VoiceError, VoiceSample,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::ApiError;
use crate::metrics::{DetailedMetricsResponse, EndpointMetricsResponse, SystemMetrics};
use crate::validation::{validate_generate_request, MAX_UPLOAD_BYTES};
use crate::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub script: String,
    pub speakers: Vec<String>,
    pub cfg_scale: Option<f32>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_base64: Option<String>,
    pub sample_rate: u32,
    pub duration_ms: u64,
    pub chunks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub log: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub generating: bool,
    pub backend: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadVoiceRequest {
    pub name: String,
    pub file_name: String,
    pub audio_base64: String,
}

#[derive(Debug, Serialize)]
pub struct UploadVoiceResponse {
    pub name: String,
    pub voices: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
    pub message: &'static str,
}

/// Server-to-client WebSocket messages.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        status: &'static str,
        message: String,
    },
    Chunk {
        chunk_index: u64,
        audio_base64: String,
        sample_rate: u32,
        duration_ms: u64,
        total_generated_secs: f32,
        is_tail: bool,
        log: String,
    },
    Complete {
        audio_base64: Option<String>,
        sample_rate: u32,
        duration_ms: u64,
        chunks: u64,
        log: String,
    },
    Cancelled {
        audio_base64: Option<String>,
        sample_rate: u32,
        duration_ms: u64,
        log: String,
    },
    Error {
        error: String,
        code: u16,
        partial: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        log: Option<String>,
    },
    Empty {
        log: String,
    },
}

/// Client-to-server control messages after the initial request.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Stop,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        generating: state.gate.is_busy(),
        backend: state.generator.name().to_string(),
    })
}

pub async fn list_voices(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.voices.names())
}

pub async fn list_examples(State(state): State<AppState>) -> Json<Vec<ExampleScript>> {
    Json(state.examples.as_ref().clone())
}

pub async fn upload_voice(
    State(state): State<AppState>,
    Json(req): Json<UploadVoiceRequest>,
) -> Result<(StatusCode, Json<UploadVoiceResponse>), ApiError> {
    // base64 expands by 4/3
    if req.audio_base64.len() / 4 * 3 > MAX_UPLOAD_BYTES {
        return Err(ApiError::InvalidInput(format!(
            "Audio upload too large (max {} MB)",
            MAX_UPLOAD_BYTES / 1024 / 1024
        )));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(req.audio_base64.trim())
        .map_err(|e| ApiError::InvalidInput(format!("audio_base64 is not valid base64: {e}")))?;

    let voices = state.voices.clone();
    let entry = tokio::task::spawn_blocking(move || voices.register(&req.name, &req.file_name, &bytes))
        .await
        .map_err(|e| ApiError::InternalError(format!("Voice upload task failed: {e}")))??;

    Ok((
        StatusCode::CREATED,
        Json(UploadVoiceResponse {
            name: entry.name,
            voices: state.voices.names(),
        }),
    ))
}

pub async fn stop(State(state): State<AppState>) -> Json<StopResponse> {
    let stopped = state.gate.cancel_current();
    if stopped {
        info!("Stop signal sent");
    }
    Json(StopResponse {
        stopped,
        message: if stopped {
            "Stop signal sent"
        } else {
            "No generation in progress"
        },
    })
}

/// Validate a request and load its reference voices from the current
/// registry snapshot.
async fn prepare_request(state: &AppState, req: GenerateRequest) -> Result<GenerationRequest, ApiError> {
    let voices = state.voices.snapshot();
    let cfg_scale = validate_generate_request(&req.script, &req.speakers, req.cfg_scale, &voices)?;
    let script = format_script(&req.script, req.speakers.len())?;

    let sample_rate = state.generator.sample_rate();
    let speakers = req.speakers;
    let samples = tokio::task::spawn_blocking(move || -> Result<Vec<VoiceSample>, VoiceError> {
        speakers
            .into_iter()
            .map(|name| {
                let path = voices
                    .get(&name)
                    .ok_or_else(|| VoiceError::NotFound(name.clone()))?;
                let samples = load_reference(path, Some(sample_rate))?;
                Ok(VoiceSample { name, samples })
            })
            .collect()
    })
    .await
    .map_err(|e| ApiError::InternalError(format!("Voice loading task failed: {e}")))??;

    Ok(GenerationRequest {
        script,
        voices: samples,
        cfg_scale,
    })
}

fn duration_ms(samples: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    (samples as f64 / sample_rate as f64 * 1000.0) as u64
}

fn complete_audio(report: &SessionReport) -> Result<Option<String>, ApiError> {
    report
        .complete
        .as_deref()
        .map(|audio| encode_wav_base64(audio, report.sample_rate))
        .transpose()
        .map_err(|e| ApiError::Generation(e.context("WAV encoding error")))
}

pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let start = Instant::now();
    let result = generate_inner(&state, req).await;
    state
        .metrics
        .generate
        .record_request(start.elapsed().as_millis() as u64);
    if result.is_err() {
        state.metrics.generate.record_error();
    }
    result.map(Json)
}

async fn generate_inner(state: &AppState, req: GenerateRequest) -> Result<GenerateResponse, ApiError> {
    let request = prepare_request(state, req).await?;
    let Some(permit) = state.gate.try_acquire() else {
        state.metrics.sessions.record_busy();
        return Err(ApiError::Busy);
    };

    // Only the final report matters here.
    let (tx, _) = mpsc::unbounded_channel();
    let report = run_admitted_session(
        state.generator.clone(),
        request,
        state.session_config.clone(),
        permit,
        tx,
    )
    .await;
    state.metrics.sessions.record(&report);

    if let Outcome::Failed { message, partial: false } = &report.outcome {
        return Err(ApiError::Generation(anyhow::anyhow!("{message}")));
    }

    let error = match &report.outcome {
        Outcome::Failed { message, .. } => Some(message.clone()),
        _ => None,
    };
    let samples = report.complete.as_ref().map_or(0, Vec::len);
    Ok(GenerateResponse {
        outcome: report.outcome.as_str(),
        audio_base64: complete_audio(&report)?,
        sample_rate: report.sample_rate,
        duration_ms: duration_ms(samples, report.sample_rate),
        chunks: report.stats.chunks_emitted,
        error,
        log: report.log,
    })
}

pub async fn generate_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream_socket(socket, state))
}

type WsSender = SplitSink<WebSocket, Message>;

/// Send one message; false when the client is gone.
async fn send_message(sender: &mut WsSender, msg: &ServerMessage) -> bool {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize WebSocket message: {e}");
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

fn error_message(err: &ApiError) -> ServerMessage {
    ServerMessage::Error {
        error: err.to_string(),
        code: err.status_code().as_u16(),
        partial: false,
        log: None,
    }
}

fn chunk_message(emission: &Emission, log: String) -> Result<ServerMessage, anyhow::Error> {
    Ok(ServerMessage::Chunk {
        chunk_index: emission.chunk_index,
        audio_base64: encode_wav_base64(&emission.samples, emission.sample_rate)?,
        sample_rate: emission.sample_rate,
        duration_ms: duration_ms(emission.samples.len(), emission.sample_rate),
        total_generated_secs: emission.total_generated_secs,
        is_tail: emission.is_tail,
        log,
    })
}

fn terminal_message(report: &SessionReport) -> ServerMessage {
    let samples = report.complete.as_ref().map_or(0, Vec::len);
    let audio = match complete_audio(report) {
        Ok(audio) => audio,
        Err(e) => return error_message(&e),
    };
    let log = report.log.clone();
    match &report.outcome {
        Outcome::Completed => ServerMessage::Complete {
            audio_base64: audio,
            sample_rate: report.sample_rate,
            duration_ms: duration_ms(samples, report.sample_rate),
            chunks: report.stats.chunks_emitted,
            log,
        },
        Outcome::Cancelled => ServerMessage::Cancelled {
            audio_base64: audio,
            sample_rate: report.sample_rate,
            duration_ms: duration_ms(samples, report.sample_rate),
            log,
        },
        Outcome::Failed { message, partial } => ServerMessage::Error {
            error: message.clone(),
            code: 500,
            partial: *partial,
            log: Some(log),
        },
        Outcome::Empty => ServerMessage::Empty { log },
    }
}

/// Wait for the client's opening request. `None` if the socket ended first.
async fn read_request(receiver: &mut SplitStream<WebSocket>) -> Option<Result<GenerateRequest, ApiError>> {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                return Some(
                    serde_json::from_str(text.as_str())
                        .map_err(|e| ApiError::InvalidInput(format!("Invalid request: {e}"))),
                )
            }
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket receive error: {e}");
                return None;
            }
        }
    }
    None
}

async fn handle_stream_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let req = match read_request(&mut receiver).await {
        Some(Ok(req)) => req,
        Some(Err(e)) => {
            let _ = send_message(&mut sender, &error_message(&e)).await;
            let _ = sender.close().await;
            return;
        }
        None => return,
    };

    let request = match prepare_request(&state, req).await {
        Ok(request) => request,
        Err(e) => {
            let _ = send_message(&mut sender, &error_message(&e)).await;
            let _ = sender.close().await;
            return;
        }
    };
    let Some(permit) = state.gate.try_acquire() else {
        state.metrics.sessions.record_busy();
        let _ = send_message(&mut sender, &error_message(&ApiError::Busy)).await;
        let _ = sender.close().await;
        return;
    };

    let start = Instant::now();
    let cancel = permit.cancel_token();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = tokio::spawn(run_admitted_session(
        state.generator.clone(),
        request,
        state.session_config.clone(),
        permit,
        tx,
    ));

    let mut client_gone = false;
    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(SessionUpdate::Progress { log }) => {
                    let msg = ServerMessage::Status { status: "generating", message: log };
                    if !send_message(&mut sender, &msg).await {
                        client_gone = true;
                        cancel.cancel();
                    }
                }
                Some(SessionUpdate::Chunk { emission, log }) => {
                    if client_gone {
                        continue;
                    }
                    let msg = match chunk_message(&emission, log) {
                        Ok(msg) => msg,
                        Err(e) => {
                            error!("Failed to encode chunk {}: {e:#}", emission.chunk_index);
                            continue;
                        }
                    };
                    if !send_message(&mut sender, &msg).await {
                        info!("Client disconnected, stopping generation");
                        client_gone = true;
                        cancel.cancel();
                    }
                }
                Some(SessionUpdate::Finished { .. }) | None => break,
            },
            incoming = receiver.next(), if !client_gone => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(ClientMessage::Stop) => {
                            info!("Stop requested by client");
                            cancel.cancel();
                        }
                        Err(e) => warn!("Ignoring unexpected client message: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    info!("Client disconnected, stopping generation");
                    client_gone = true;
                    cancel.cancel();
                }
                Some(Ok(_)) => {}
            },
        }
    }

    let report = match session.await {
        Ok(report) => report,
        Err(e) => {
            error!("Generation session task failed: {e}");
            state.metrics.stream.record_error();
            if !client_gone {
                let err = ApiError::InternalError(format!("Generation session failed: {e}"));
                let _ = send_message(&mut sender, &error_message(&err)).await;
                let _ = sender.close().await;
            }
            return;
        }
    };

    state.metrics.sessions.record(&report);
    state
        .metrics
        .stream
        .record_request(start.elapsed().as_millis() as u64);
    if matches!(report.outcome, Outcome::Failed { .. }) {
        state.metrics.stream.record_error();
    }

    if !client_gone {
        let _ = send_message(&mut sender, &terminal_message(&report)).await;
        let _ = sender.close().await;
    }
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<DetailedMetricsResponse> {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    // Get CPU usage (average across all cores)
    let cpu_usage = system.global_cpu_info().cpu_usage();

    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    // Get system load (Unix-like systems only)
    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|loadavg| loadavg.split_whitespace().next().and_then(|s| s.parse::<f64>().ok()))
        }
        #[cfg(not(unix))]
        None
    };

    Json(DetailedMetricsResponse {
        timestamp: chrono::Utc::now(),
        system: SystemMetrics {
            cpu_usage_percent: cpu_usage,
            memory_used_mb: memory_used / 1024 / 1024, // Convert bytes to MB
            memory_total_mb: memory_total / 1024 / 1024,
            memory_usage_percent,
            uptime_seconds: state.started_at.elapsed().as_secs(),
            system_load,
        },
        endpoints: EndpointMetricsResponse {
            generate: state.metrics.generate.stats(),
            stream: state.metrics.stream.stats(),
        },
        sessions: state.metrics.sessions.snapshot(),
    })
}
