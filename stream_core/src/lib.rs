//! Streaming core for podcast-style speech generation.
//!
//! A [`Generator`] produces audio on a blocking worker thread and pushes it
//! fragment by fragment; [`run_session`] re-chunks that stream with a
//! [`StreamAggregator`] into playback-sized emissions and supports
//! cooperative cancellation at any point.
pub mod aggregator;
pub mod fragment;
pub mod generator;
pub mod piper;
pub mod script;
pub mod session;
pub mod stream;
pub mod voices;
pub mod wav;

pub use aggregator::{
    AggregatorConfig, AggregatorStats, Emission, Finalized, IngestError, StreamAggregator,
};
pub use fragment::{Fragment, DEFAULT_SAMPLE_RATE};
pub use generator::{GenerationRequest, Generator, VoiceSample};
pub use piper::PiperGenerator;
pub use script::{
    detect_speaker_count, format_script, load_example_scripts, parse_turns, ExampleScript, FormattedScript,
    ScriptError, Turn, MAX_SPEAKERS,
};
pub use session::{
    run_admitted_session, run_session, Outcome, SessionConfig, SessionGate, SessionPermit, SessionReport, SessionUpdate,
};
pub use stream::{fragment_channel, CancelToken, FragmentSink, FragmentStream, Recv, SinkError, StreamEvent};
pub use voices::{load_reference, resample, VoiceEntry, VoiceError, VoiceRegistry};
pub use wav::{encode_wav_base64, encode_wav_bytes, to_pcm16, write_wav};
