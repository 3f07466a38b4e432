//! The seam to the external model runtime.

use crate::script::FormattedScript;
use crate::stream::FragmentSink;

/// Pre-loaded reference audio for one speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSample {
    pub name: String,
    pub samples: Vec<f32>,
}

/// Everything a generator needs for one session.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub script: FormattedScript,
    pub voices: Vec<VoiceSample>,
    pub cfg_scale: f32,
}

impl GenerationRequest {
    pub fn speaker_names(&self) -> Vec<&str> {
        self.voices.iter().map(|v| v.name.as_str()).collect()
    }
}

/// A text-to-speech backend producing audio incrementally.
///
/// `generate` runs on a dedicated blocking thread. Implementations push
/// each piece of audio to `sink` as soon as it exists and check
/// [`FragmentSink::is_cancelled`] (or the error from `push`) between
/// pieces. Completion and failure are reported through the return value;
/// the session loop turns that into the stream's terminal event.
pub trait Generator: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn sample_rate(&self) -> u32;

    fn generate(&self, request: &GenerationRequest, sink: &FragmentSink) -> anyhow::Result<()>;
}
