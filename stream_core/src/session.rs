//! One generation request, from worker start to terminal state.
//!
//! [`run_session`] spawns the generator on a blocking thread, drains its
//! fragments into a fresh [`StreamAggregator`], forwards emissions to the
//! consumer and classifies how the session ended. [`SessionGate`] is the
//! caller-side admission control that keeps sessions serialized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::{AggregatorConfig, AggregatorStats, Emission, Finalized, StreamAggregator};
use crate::generator::{GenerationRequest, Generator};
use crate::stream::{fragment_channel, CancelToken, Recv, StreamEvent};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub aggregator: AggregatorConfig,
    /// Longest the loop waits for a fragment before re-checking
    /// cancellation and the max-wait timer.
    pub poll_interval: Duration,
    /// Bound on waiting for the worker thread once the stream has ended.
    pub join_timeout: Duration,
    /// `None` buffers without limit; `Some(n)` applies backpressure.
    pub channel_capacity: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            aggregator: AggregatorConfig::default(),
            poll_interval: Duration::from_millis(200),
            join_timeout: Duration::from_secs(5),
            channel_capacity: None,
        }
    }
}

impl SessionConfig {
    pub fn with_aggregator(mut self, aggregator: AggregatorConfig) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = Some(capacity);
        self
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Cancelled,
    /// The generator reported an error. `partial` is set when some audio
    /// had already been received.
    Failed { message: String, partial: bool },
    /// The generator finished without producing any audio.
    Empty,
}

impl Outcome {
    /// Cancellation wins over errors, errors over empty output.
    pub fn classify(cancelled: bool, error: Option<String>, received_any: bool) -> Self {
        if cancelled {
            Outcome::Cancelled
        } else if let Some(message) = error {
            Outcome::Failed {
                message,
                partial: received_any,
            }
        } else if !received_any {
            Outcome::Empty
        } else {
            Outcome::Completed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Cancelled => "cancelled",
            Outcome::Failed { .. } => "failed",
            Outcome::Empty => "empty",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

/// Consumer-facing feed of a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Status text without new audio.
    Progress { log: String },
    /// A streaming emission, including the final tail flush.
    Chunk { emission: Emission, log: String },
    /// Always the last update of a session.
    Finished { outcome: Outcome, log: String },
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: Uuid,
    pub outcome: Outcome,
    pub sample_rate: u32,
    /// Whole-session audio; partial for cancelled or failed sessions.
    pub complete: Option<Vec<f32>>,
    pub stats: AggregatorStats,
    /// The worker did not join within the timeout and was left behind.
    pub forced_stop: bool,
    pub generation_time: Duration,
    pub log: String,
}

impl SessionReport {
    pub fn duration_secs(&self) -> f32 {
        match &self.complete {
            Some(audio) if self.sample_rate > 0 => audio.len() as f32 / self.sample_rate as f32,
            _ => 0.0,
        }
    }
}

/// Run one session to its terminal state.
///
/// Updates go to `updates` as they happen; a closed update channel does
/// not stop generation (use `cancel` for that).
pub async fn run_session(
    generator: Arc<dyn Generator>,
    request: GenerationRequest,
    config: SessionConfig,
    cancel: CancelToken,
    updates: mpsc::UnboundedSender<SessionUpdate>,
) -> SessionReport {
    drive(generator, request, config, cancel, None, updates).await
}

/// Run a session admitted through a [`SessionGate`].
///
/// The worker thread holds the admission until it returns, so the gate
/// stays busy after a forced stop until the thread left behind exits.
pub async fn run_admitted_session(
    generator: Arc<dyn Generator>,
    request: GenerationRequest,
    config: SessionConfig,
    permit: SessionPermit,
    updates: mpsc::UnboundedSender<SessionUpdate>,
) -> SessionReport {
    let admission = Arc::clone(&permit.admission);
    drive(generator, request, config, permit.cancel_token(), Some(admission), updates).await
}

async fn drive(
    generator: Arc<dyn Generator>,
    request: GenerationRequest,
    config: SessionConfig,
    cancel: CancelToken,
    admission: Option<Arc<Admission>>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
) -> SessionReport {
    let id = Uuid::new_v4();
    let started = Instant::now();
    let sample_rate = generator.sample_rate();
    let aggregator_config = config.aggregator.clone().with_sample_rate(sample_rate);
    let mut aggregator = StreamAggregator::starting_at(aggregator_config, started);

    let header = session_header(&request);
    info!(
        session = %id,
        backend = generator.name(),
        speakers = request.voices.len(),
        turns = request.script.turn_count(),
        "Starting generation session"
    );
    let _ = updates.send(SessionUpdate::Progress {
        log: format!("{header}Processing with {} (streaming mode)...\n", generator.name()),
    });

    let (sink, mut stream) = fragment_channel(cancel.clone(), config.channel_capacity);
    let worker = {
        let generator = Arc::clone(&generator);
        tokio::task::spawn_blocking(move || {
            let _admission = admission;
            if sink.is_cancelled() {
                return;
            }
            let result = generator.generate(&request, &sink);
            // A cancelled stream ends without Finished/Failed; the token decides.
            if sink.is_cancelled() {
                debug!("Generation worker stopped after {} fragments", sink.pushed());
                return;
            }
            match result {
                Ok(()) => sink.finish(),
                Err(e) => {
                    error!("Error in generation worker: {e:#}");
                    sink.fail(format!("{e:#}"));
                }
            }
        })
    };

    let mut producer_error: Option<String> = None;
    loop {
        if cancel.is_cancelled() {
            aggregator.cancel();
            break;
        }

        match stream.recv_timeout(config.poll_interval).await {
            Recv::Event(StreamEvent::Fragment(fragment)) => {
                if let Err(e) = aggregator.ingest(fragment) {
                    warn!(session = %id, "{e}");
                }
            }
            Recv::Event(StreamEvent::Finished) => break,
            Recv::Event(StreamEvent::Failed(message)) => {
                producer_error = Some(message);
                break;
            }
            Recv::Closed => break,
            Recv::Timeout => {}
        }

        if cancel.is_cancelled() {
            aggregator.cancel();
            break;
        }

        if let Some(emission) = aggregator.poll_emit(Instant::now()) {
            let log = format!(
                "{header}Streaming: {:.1}s generated (chunk {})\n",
                emission.total_generated_secs, emission.chunk_index
            );
            debug!(session = %id, chunk = emission.chunk_index, samples = emission.samples.len(), "Emitting chunk");
            let _ = updates.send(SessionUpdate::Chunk { emission, log });
        }
    }

    // The worker may notice the token and end the stream before the loop does.
    if cancel.is_cancelled() {
        aggregator.cancel();
    }

    // Nothing more is read; a producer still running sees its next push fail.
    stream.close();

    let forced_stop = match tokio::time::timeout(config.join_timeout, worker).await {
        Ok(Ok(())) => false,
        Ok(Err(join_err)) => {
            error!(session = %id, "Generation worker panicked: {join_err}");
            producer_error.get_or_insert_with(|| format!("generation worker panicked: {join_err}"));
            false
        }
        Err(_) => {
            warn!(
                session = %id,
                "Generation worker did not stop within {:?}, forcing stream end",
                config.join_timeout
            );
            true
        }
    };
    drop(stream);

    let cancelled = aggregator.is_cancelled();
    let received_any = aggregator.received_any();
    let complete = match aggregator.finalize() {
        Finalized::Audio { tail, complete } => {
            if let Some(emission) = tail {
                let log = format!(
                    "{header}Streaming final chunk: {:.1}s total\n",
                    emission.total_generated_secs
                );
                let _ = updates.send(SessionUpdate::Chunk { emission, log });
            }
            Some(complete)
        }
        Finalized::NoAudio | Finalized::AlreadyFinalized => None,
    };

    let generation_time = started.elapsed();
    let stats = aggregator.stats();
    let outcome = Outcome::classify(cancelled, producer_error, received_any);
    let log = final_log(&header, &outcome, &stats, sample_rate, generation_time, forced_stop);

    match &outcome {
        Outcome::Completed => info!(
            session = %id,
            chunks = stats.chunks_emitted,
            samples = stats.samples_ingested,
            "Generation completed in {:.2}s",
            generation_time.as_secs_f64()
        ),
        Outcome::Cancelled => info!(session = %id, "Generation stopped by user"),
        Outcome::Failed { message, partial } => {
            warn!(session = %id, partial, "Generation failed: {message}")
        }
        Outcome::Empty => warn!(session = %id, "Generation produced no audio"),
    }

    let _ = updates.send(SessionUpdate::Finished {
        outcome: outcome.clone(),
        log: log.clone(),
    });

    SessionReport {
        id,
        outcome,
        sample_rate,
        complete,
        stats,
        forced_stop,
        generation_time,
        log,
    }
}

fn session_header(request: &GenerationRequest) -> String {
    let mut header = format!(
        "Generating podcast with {} speakers\n",
        request.voices.len()
    );
    header.push_str(&format!("Parameters: CFG Scale={}\n", request.cfg_scale));
    header.push_str(&format!("Speakers: {}\n", request.speaker_names().join(", ")));
    header.push_str(&format!(
        "Formatted script with {} turns\n",
        request.script.turn_count()
    ));
    header
}

fn final_log(
    header: &str,
    outcome: &Outcome,
    stats: &AggregatorStats,
    sample_rate: u32,
    generation_time: Duration,
    forced_stop: bool,
) -> String {
    let secs = generation_time.as_secs_f64();
    let audio_secs = if sample_rate > 0 {
        stats.samples_ingested as f64 / sample_rate as f64
    } else {
        0.0
    };
    let mut log = header.to_string();
    match outcome {
        Outcome::Completed => {
            log.push_str(&format!("Generation completed in {secs:.2} seconds\n"));
            log.push_str(&format!("Final audio duration: {audio_secs:.2} seconds\n"));
            log.push_str(&format!("Total chunks: {}\n", stats.fragments_ingested));
            log.push_str("Generation successful! Complete audio is ready.\n");
        }
        Outcome::Cancelled => {
            log.push_str("Generation stopped by user\n");
            if stats.samples_ingested > 0 {
                log.push_str(&format!("Partial audio kept: {audio_secs:.2} seconds\n"));
            }
        }
        Outcome::Failed { message, partial } => {
            log.push_str(&format!("Error during generation: {message}\n"));
            if *partial {
                log.push_str(&format!(
                    "Partial audio kept: {audio_secs:.2} seconds in {} chunks\n",
                    stats.fragments_ingested
                ));
            }
        }
        Outcome::Empty => {
            log.push_str(&format!(
                "Error: No audio chunks were received from the model. Generation time: {secs:.2}s\n"
            ));
        }
    }
    if forced_stop {
        log.push_str("Warning: generation worker did not stop in time and was left behind\n");
    }
    log
}

/// System-wide admission control: at most one session at a time.
#[derive(Debug, Clone, Default)]
pub struct SessionGate {
    inner: Arc<GateInner>,
}

#[derive(Debug, Default)]
struct GateInner {
    busy: AtomicBool,
    current: Mutex<Option<CancelToken>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate for a new session, or `None` if one is running.
    pub fn try_acquire(&self) -> Option<SessionPermit> {
        self.inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let cancel = CancelToken::new();
        *self.current() = Some(cancel.clone());
        Some(SessionPermit {
            admission: Arc::new(Admission { gate: self.clone() }),
            cancel,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// Request cancellation of the running session, if any.
    /// Returns whether a session was running.
    pub fn cancel_current(&self) -> bool {
        match self.current().as_ref() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn current(&self) -> std::sync::MutexGuard<'_, Option<CancelToken>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps the gate busy; released when the last holder drops.
#[derive(Debug)]
struct Admission {
    gate: SessionGate,
}

impl Drop for Admission {
    fn drop(&mut self) {
        *self.gate.current() = None;
        self.gate.inner.busy.store(false, Ordering::Release);
    }
}

/// Held for the lifetime of a session. Dropping it cancels the session's
/// token; the gate is released once no worker thread still holds the
/// admission.
#[derive(Debug)]
pub struct SessionPermit {
    admission: Arc<Admission>,
    cancel: CancelToken,
}

impl SessionPermit {
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
