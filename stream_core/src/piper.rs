//! Local Piper backend.
//!
//! Piper has no voice cloning: reference samples in the request are
//! ignored and every turn is spoken with the model's own voice. Audio is
//! pushed per synthesized part, so a long turn still streams.
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use anyhow::Context;
use piper_rs::synth::{PiperSpeechStreamParallel, PiperSpeechSynthesizer};
use tracing::{debug, info};

use crate::generator::{GenerationRequest, Generator};
use crate::stream::{FragmentSink, SinkError};

/// Silence inserted between speaker turns.
const TURN_PAUSE_MS: u32 = 300;

pub struct PiperGenerator {
    synth: RwLock<PiperSpeechSynthesizer>,
    sample_rate: u32,
}

// PiperSpeechSynthesizer doesn't implement Debug
impl fmt::Debug for PiperGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PiperGenerator")
            .field("synth", &"<PiperSpeechSynthesizer>")
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl PiperGenerator {
    /// Load a model from its `.onnx.json` config.
    pub fn from_config_path<P: AsRef<Path>>(cfg_path: P) -> anyhow::Result<Self> {
        let cfg_path = cfg_path.as_ref();
        let sample_rate = read_sample_rate(cfg_path)?;
        let model = piper_rs::from_config_path(cfg_path)
            .map_err(|e| anyhow::anyhow!("piper load error: {e}"))?;
        let synth = PiperSpeechSynthesizer::new(model)?;
        info!(config = %cfg_path.display(), sample_rate, "Loaded Piper model");
        Ok(Self {
            synth: RwLock::new(synth),
            sample_rate,
        })
    }
}

impl Generator for PiperGenerator {
    fn name(&self) -> &str {
        "piper"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn generate(&self, request: &GenerationRequest, sink: &FragmentSink) -> anyhow::Result<()> {
        let synth = self
            .synth
            .read()
            .map_err(|_| anyhow::anyhow!("Synthesizer lock poisoned - this indicates a previous panic. Please restart the server."))?;
        let pause_samples = (TURN_PAUSE_MS as f32 / 1000.0 * self.sample_rate as f32) as usize;

        for (i, turn) in request.script.turns.iter().enumerate() {
            if sink.is_cancelled() {
                debug!(turn = i, "Cancelled before turn");
                return Ok(());
            }
            if i > 0 && !keep_going(sink.push(vec![0.0f32; pause_samples])) {
                return Ok(());
            }

            let iter: PiperSpeechStreamParallel = synth
                .synthesize_parallel(turn.text.clone(), None)
                .map_err(|e| anyhow::anyhow!("piper synth error: {e}"))?;
            for part in iter {
                let samples = part.map_err(|e| anyhow::anyhow!("chunk error: {e}"))?.into_vec();
                if !keep_going(sink.push(samples)) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// False once the session no longer wants audio.
fn keep_going(pushed: Result<(), SinkError>) -> bool {
    match pushed {
        Ok(()) => true,
        Err(e) => {
            debug!("Stopping synthesis: {e}");
            false
        }
    }
}

/// Read sample rate from model config JSON
fn read_sample_rate(cfg_path: &Path) -> anyhow::Result<u32> {
    let text = fs::read_to_string(cfg_path)
        .with_context(|| format!("Failed to read config file: {}", cfg_path.display()))?;
    sample_rate_from_config(&text)
}

fn sample_rate_from_config(text: &str) -> anyhow::Result<u32> {
    let json: serde_json::Value =
        serde_json::from_str(text).with_context(|| "Config file is not valid JSON")?;
    let sample_rate = json
        .get("audio")
        .and_then(|a| a.get("sample_rate"))
        .and_then(|sr| sr.as_u64())
        .ok_or_else(|| anyhow::anyhow!("Missing or invalid 'audio.sample_rate' in config"))?;
    Ok(sample_rate as u32)
}
