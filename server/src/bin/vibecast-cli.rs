use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use stream_core::{
    load_reference, parse_turns, run_session, write_wav, CancelToken, FormattedScript,
    GenerationRequest, Generator, Outcome, PiperGenerator, SessionConfig, SessionUpdate, Turn, VoiceRegistry,
    VoiceSample,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "vibecast-cli")]
#[command(about = "Generate a multi-speaker podcast from a script file")]
struct Cli {
    /// Script with `Speaker N:` lines
    #[arg(long)]
    txt_path: PathBuf,
    /// Voice names in speaker order (Speaker 1 first)
    #[arg(long, num_args = 1.., required = true)]
    speaker_names: Vec<String>,
    #[arg(long, default_value = "./outputs")]
    output_dir: PathBuf,
    #[arg(long, default_value = "voices")]
    voices_dir: PathBuf,
    #[arg(long, default_value = "models/voice.onnx.json")]
    piper_config: PathBuf,
    #[arg(long, default_value_t = 1.3)]
    cfg_scale: f32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    run(cli).await
}

/// Renumber file speaker ids to 0-based positions and pick each one's
/// voice name. Scripts numbered from 0 index `names` directly, scripts
/// numbered from 1 are shifted down.
fn assign_speakers(turns: Vec<Turn>, names: &[String]) -> (Vec<Turn>, Vec<String>) {
    let ids: Vec<usize> = turns
        .iter()
        .map(|t| t.speaker)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let zero_based = ids.first() == Some(&0);

    let speakers = ids
        .iter()
        .map(|&id| {
            let slot = if zero_based { id } else { id - 1 };
            names
                .get(slot)
                .cloned()
                .unwrap_or_else(|| format!("Speaker {id}"))
        })
        .collect();

    let turns = turns
        .into_iter()
        .map(|t| Turn {
            speaker: ids.iter().position(|&id| id == t.speaker).unwrap_or_default(),
            text: t.text,
        })
        .collect();
    (turns, speakers)
}

async fn run(cli: Cli) -> Result<()> {
    if !(1.0..=2.0).contains(&cli.cfg_scale) {
        bail!("--cfg-scale must be between 1.0 and 2.0, got {}", cli.cfg_scale);
    }

    let raw = fs::read_to_string(&cli.txt_path)
        .with_context(|| format!("Failed to read {}", cli.txt_path.display()))?;
    let turns = parse_turns(&raw);
    if turns.is_empty() {
        bail!("No valid speaker scripts found in {}", cli.txt_path.display());
    }
    info!("Found {} speaker segments", turns.len());

    let (turns, speaker_names) = assign_speakers(turns, &cli.speaker_names);

    let registry = VoiceRegistry::scan(&cli.voices_dir);
    let piper_config = cli.piper_config.clone();
    let generator = tokio::task::spawn_blocking(move || PiperGenerator::from_config_path(piper_config))
        .await??;
    let sample_rate = generator.sample_rate();

    let mut voices = Vec::with_capacity(speaker_names.len());
    for (i, name) in speaker_names.iter().enumerate() {
        let entry = registry
            .resolve_fuzzy(name)
            .with_context(|| format!("No voice presets found in {}", cli.voices_dir.display()))?;
        info!("Speaker {} ('{}') -> Voice: {}", i + 1, name, entry.path.display());
        let samples = load_reference(&entry.path, Some(sample_rate))
            .with_context(|| format!("Failed to load voice {}", entry.path.display()))?;
        voices.push(VoiceSample {
            name: entry.name,
            samples,
        });
    }

    let request = GenerationRequest {
        script: FormattedScript { turns },
        voices,
        cfg_scale: cli.cfg_scale,
    };

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping generation...");
                cancel.cancel();
            }
        });
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let progress = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update {
                SessionUpdate::Chunk { emission, .. } => info!(
                    "Streaming: {:.1}s generated (chunk {})",
                    emission.total_generated_secs, emission.chunk_index
                ),
                SessionUpdate::Progress { .. } => info!("Starting generation..."),
                SessionUpdate::Finished { .. } => break,
            }
        }
    });

    let report = run_session(
        Arc::new(generator),
        request,
        SessionConfig::default(),
        cancel,
        tx,
    )
    .await;
    let _ = progress.await;

    if let Some(audio) = report.complete.as_deref() {
        fs::create_dir_all(&cli.output_dir)
            .with_context(|| format!("Failed to create {}", cli.output_dir.display()))?;
        let stem = cli
            .txt_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("podcast");
        let output_path = cli.output_dir.join(format!("{stem}_generated.wav"));
        write_wav(&output_path, audio, report.sample_rate)?;

        let generation_secs = report.generation_time.as_secs_f32();
        let audio_secs = report.duration_secs();
        println!("Saved output to {}", output_path.display());
        println!("Generation time: {generation_secs:.2} seconds");
        println!("Generated audio duration: {audio_secs:.2} seconds");
        if audio_secs > 0.0 {
            println!("RTF (Real Time Factor): {:.2}x", generation_secs / audio_secs);
        }
    }

    match report.outcome {
        Outcome::Completed => Ok(()),
        Outcome::Cancelled => {
            println!("Generation stopped by user");
            Ok(())
        }
        Outcome::Failed { message, .. } => bail!("Generation failed: {message}"),
        Outcome::Empty => bail!("No audio was generated"),
    }
}
