//! Common utilities for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use axum::Router;
use server::{app, config::ServerConfig, AppState};
use stream_core::{write_wav, FragmentSink, GenerationRequest, Generator, VoiceRegistry};
use tempfile::TempDir;

pub const TEST_SAMPLE_RATE: u32 = 100;

/// Backend that produces silence on a fixed schedule.
pub struct FakeGenerator {
    pub fragments: usize,
    pub fragment_len: usize,
    pub delay: Duration,
    pub fail: Option<&'static str>,
}

impl FakeGenerator {
    pub fn quick() -> Self {
        Self {
            fragments: 5,
            fragment_len: 50,
            delay: Duration::ZERO,
            fail: None,
        }
    }

    /// Runs until stopped.
    pub fn endless() -> Self {
        Self {
            fragments: usize::MAX,
            fragment_len: 25,
            delay: Duration::from_millis(5),
            fail: None,
        }
    }

    pub fn failing(message: &'static str) -> Self {
        Self {
            fragments: 0,
            fragment_len: 0,
            delay: Duration::ZERO,
            fail: Some(message),
        }
    }
}

impl Generator for FakeGenerator {
    fn name(&self) -> &str {
        "fake"
    }

    fn sample_rate(&self) -> u32 {
        TEST_SAMPLE_RATE
    }

    fn generate(&self, _request: &GenerationRequest, sink: &FragmentSink) -> anyhow::Result<()> {
        for _ in 0..self.fragments {
            thread::sleep(self.delay);
            if sink.push(vec![0.1f32; self.fragment_len]).is_err() {
                return Ok(());
            }
        }
        match self.fail {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(()),
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub voices_dir: TempDir,
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        min_chunk_secs: 1.0,
        max_wait_secs: 60.0,
        join_timeout_secs: 1,
        poll_interval_ms: 10,
        ..ServerConfig::default()
    }
}

/// Reference recording of `secs` seconds at 8 kHz.
pub fn write_voice(dir: &std::path::Path, name: &str, secs: f32) {
    let samples = vec![0.2f32; (secs * 8000.0) as usize];
    write_wav(dir.join(format!("{name}.wav")), &samples, 8000).unwrap();
}

/// Create a test app instance with voices "Alice" and "Bob".
pub fn create_test_app(generator: FakeGenerator) -> TestApp {
    create_test_app_with(generator, test_config())
}

/// Same as [`create_test_app`] with a custom configuration. One example
/// script is placed in a `scripts/` subdirectory of the voices directory.
pub fn create_test_app_with(generator: FakeGenerator, config: ServerConfig) -> TestApp {
    let voices_dir = tempfile::tempdir().unwrap();
    write_voice(voices_dir.path(), "Alice", 1.0);
    write_voice(voices_dir.path(), "Bob", 1.0);

    let scripts = voices_dir.path().join("scripts");
    std::fs::create_dir(&scripts).unwrap();
    std::fs::write(scripts.join("interview.txt"), "Speaker 1: Welcome\n\nSpeaker 2: Thanks\n").unwrap();
    std::fs::write(scripts.join("marathon_60min.txt"), "Speaker 1: Long").unwrap();

    let voices = VoiceRegistry::scan(voices_dir.path());
    let config = ServerConfig {
        examples_dir: scripts,
        ..config
    };
    let state = AppState::new(Arc::new(generator), voices, config);
    let router = app(state.clone()).unwrap();
    TestApp {
        router,
        state,
        voices_dir,
    }
}
