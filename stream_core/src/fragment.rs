//! Audio fragments handed from a generation worker to the aggregator.

use std::sync::Arc;

/// VibeVoice output rate. Backends with their own rate report it through
/// [`crate::Generator::sample_rate`].
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// One small unit of generated mono audio plus its position in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    index: u64,
    samples: Arc<[f32]>,
}

impl Fragment {
    pub fn new(index: u64, samples: impl Into<Arc<[f32]>>) -> Self {
        Self {
            index,
            samples: samples.into(),
        }
    }

    /// Zero-based sequence index assigned by the producer.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self, sample_rate: u32) -> f32 {
        samples_to_secs(self.samples.len(), sample_rate)
    }
}

pub(crate) fn samples_to_secs(samples: usize, sample_rate: u32) -> f32 {
    if sample_rate == 0 {
        return 0.0;
    }
    samples as f32 / sample_rate as f32
}
