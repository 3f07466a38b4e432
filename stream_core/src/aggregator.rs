//! Streaming aggregator.
//!
//! Turns the irregular fragment stream of a generation worker into fewer,
//! larger chunks for the consumer. The first chunk waits for a minimum
//! amount of audio so playback does not open with a stutter; later chunks
//! go out when either that minimum is buffered again or the max-wait
//! interval since the previous emission has passed.
//!
//! The aggregator is a plain single-owner state machine. Time is passed in
//! by the caller so the policy can be driven deterministically; the
//! session loop in [`crate::session`] owns one instance per request.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::fragment::{samples_to_secs, Fragment, DEFAULT_SAMPLE_RATE};

/// Emission thresholds for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub sample_rate: u32,
    /// Amount of buffered audio that triggers an emission.
    pub min_chunk: Duration,
    /// Wall-clock bound between emissions once the first chunk is out.
    pub max_wait: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            min_chunk: Duration::from_secs(30),
            max_wait: Duration::from_secs(15),
        }
    }
}

impl AggregatorConfig {
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_min_chunk(mut self, min_chunk: Duration) -> Self {
        self.min_chunk = min_chunk;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Minimum chunk expressed in samples at the configured rate.
    pub fn min_chunk_samples(&self) -> usize {
        (self.sample_rate as f64 * self.min_chunk.as_secs_f64()).round() as usize
    }
}

/// A contiguous chunk pushed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    /// 1-based position among this session's emissions.
    pub chunk_index: u64,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
    /// Sequence indices of the first and last fragment in this chunk.
    pub first_fragment: u64,
    pub last_fragment: u64,
    /// Audio generated so far in the session, this chunk included.
    pub total_generated_secs: f32,
    /// Set on the flush performed by [`StreamAggregator::finalize`].
    pub is_tail: bool,
}

impl Emission {
    pub fn duration_secs(&self) -> f32 {
        samples_to_secs(self.samples.len(), self.sample_rate)
    }
}

/// Result of closing a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Finalized {
    /// No fragment was ever ingested.
    NoAudio,
    Audio {
        /// Remaining buffered audio, if any was still pending.
        tail: Option<Emission>,
        /// Every ingested fragment, concatenated in arrival order.
        complete: Vec<f32>,
    },
    AlreadyFinalized,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("session was cancelled, fragment dropped")]
    Cancelled,
    #[error("session already finalized, fragment dropped")]
    Finalized,
    #[error("fragment out of order: expected index {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
}

/// Counters describing one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatorStats {
    pub fragments_ingested: u64,
    pub samples_ingested: usize,
    pub samples_emitted: usize,
    pub chunks_emitted: u64,
    pub first_chunk_emitted: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct StreamAggregator {
    config: AggregatorConfig,
    pending: Vec<Fragment>,
    pending_samples: usize,
    history: Vec<Fragment>,
    next_index: u64,
    samples_ingested: usize,
    samples_emitted: usize,
    chunks_emitted: u64,
    first_chunk_emitted: bool,
    cancelled: bool,
    finalized: bool,
    started_at: Instant,
    last_emit_at: Option<Instant>,
}

impl StreamAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    /// Create an aggregator whose session clock starts at `started_at`.
    pub fn starting_at(config: AggregatorConfig, started_at: Instant) -> Self {
        Self {
            config,
            pending: Vec::new(),
            pending_samples: 0,
            history: Vec::new(),
            next_index: 0,
            samples_ingested: 0,
            samples_emitted: 0,
            chunks_emitted: 0,
            first_chunk_emitted: false,
            cancelled: false,
            finalized: false,
            started_at,
            last_emit_at: None,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Append a fragment to the pending buffer.
    pub fn ingest(&mut self, fragment: Fragment) -> Result<(), IngestError> {
        if self.finalized {
            return Err(IngestError::Finalized);
        }
        if self.cancelled {
            return Err(IngestError::Cancelled);
        }
        if fragment.index() != self.next_index {
            return Err(IngestError::OutOfOrder {
                expected: self.next_index,
                got: fragment.index(),
            });
        }

        self.next_index += 1;
        self.pending_samples += fragment.len();
        self.samples_ingested += fragment.len();
        self.history.push(fragment.clone());
        self.pending.push(fragment);
        Ok(())
    }

    /// Emit the pending buffer if the policy allows it at `now`.
    ///
    /// Never blocks; returns `None` when nothing is buffered or no
    /// threshold has been reached. After [`cancel`](Self::cancel) the
    /// already-buffered audio is flushed on the next call regardless of
    /// thresholds, since nothing more will arrive.
    pub fn poll_emit(&mut self, now: Instant) -> Option<Emission> {
        if self.finalized || self.pending.is_empty() {
            return None;
        }

        let enough_audio = self.pending_samples >= self.config.min_chunk_samples();
        let should_emit = if self.cancelled {
            true
        } else if !self.first_chunk_emitted {
            enough_audio
        } else {
            let waited = self
                .last_emit_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
            enough_audio || waited >= self.config.max_wait
        };

        if !should_emit {
            return None;
        }
        Some(self.flush(now, false))
    }

    /// Flush whatever is left and hand back the whole session's audio.
    pub fn finalize(&mut self) -> Finalized {
        if self.finalized {
            return Finalized::AlreadyFinalized;
        }
        self.finalized = true;

        if self.history.is_empty() {
            return Finalized::NoAudio;
        }

        let tail = if self.pending.is_empty() {
            None
        } else {
            Some(self.flush(Instant::now(), true))
        };

        let mut complete = Vec::with_capacity(self.samples_ingested);
        for frag in &self.history {
            complete.extend_from_slice(frag.samples());
        }
        Finalized::Audio { tail, complete }
    }

    /// Stop accepting fragments. Safe to call any number of times.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether any fragment was ever ingested in this session.
    pub fn received_any(&self) -> bool {
        !self.history.is_empty()
    }

    pub fn pending_samples(&self) -> usize {
        self.pending_samples
    }

    pub fn generated_secs(&self) -> f32 {
        samples_to_secs(self.samples_ingested, self.config.sample_rate)
    }

    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            fragments_ingested: self.next_index,
            samples_ingested: self.samples_ingested,
            samples_emitted: self.samples_emitted,
            chunks_emitted: self.chunks_emitted,
            first_chunk_emitted: self.first_chunk_emitted,
            cancelled: self.cancelled,
            elapsed: self.started_at.elapsed(),
        }
    }

    fn flush(&mut self, now: Instant, is_tail: bool) -> Emission {
        let pending = std::mem::take(&mut self.pending);
        let first_fragment = pending.first().map(Fragment::index).unwrap_or_default();
        let last_fragment = pending.last().map(Fragment::index).unwrap_or_default();

        let mut samples = Vec::with_capacity(self.pending_samples);
        for frag in &pending {
            samples.extend_from_slice(frag.samples());
        }

        self.pending_samples = 0;
        self.samples_emitted += samples.len();
        self.chunks_emitted += 1;
        self.first_chunk_emitted = true;
        self.last_emit_at = Some(now);

        Emission {
            chunk_index: self.chunks_emitted,
            sample_rate: self.config.sample_rate,
            samples,
            first_fragment,
            last_fragment,
            total_generated_secs: self.generated_secs(),
            is_tail,
        }
    }
}
