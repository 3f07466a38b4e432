//! Podcast script handling: speaker-turn formatting and file parsing.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const MAX_SPEAKERS: usize = 4;
/// Example scripts whose file name advertises a longer runtime are skipped.
pub const MAX_EXAMPLE_MINUTES: u32 = 15;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Please provide a script.")]
    EmptyScript,
    #[error("Number of speakers must be between 1 and {MAX_SPEAKERS}, got {0}.")]
    InvalidSpeakerCount(usize),
}

/// One line of dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub speaker: usize,
    pub text: String,
}

impl fmt::Display for Turn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Speaker {}: {}", self.speaker, self.text)
    }
}

/// A script in `Speaker N: text` form, one turn per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedScript {
    pub turns: Vec<Turn>,
}

impl FormattedScript {
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn text(&self) -> String {
        self.turns
            .iter()
            .map(Turn::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Format free-form script text for `num_speakers` voices.
///
/// Lines that already carry a `Speaker N:` prefix are kept as-is; other
/// lines are assigned to speakers in rotation by their position.
pub fn format_script(raw: &str, num_speakers: usize) -> Result<FormattedScript, ScriptError> {
    if raw.trim().is_empty() {
        return Err(ScriptError::EmptyScript);
    }
    if num_speakers == 0 || num_speakers > MAX_SPEAKERS {
        return Err(ScriptError::InvalidSpeakerCount(num_speakers));
    }

    let normalized = raw.replace('\u{2019}', "'");
    let mut turns = Vec::new();
    for line in normalized.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match split_speaker_line(line) {
            Some((speaker, text)) => turns.push(Turn {
                speaker,
                text: text.to_string(),
            }),
            None => turns.push(Turn {
                speaker: turns.len() % num_speakers,
                text: line.to_string(),
            }),
        }
    }
    Ok(FormattedScript { turns })
}

/// Parse a script file where `Speaker N:` lines open a turn and other
/// lines continue the current one. Text before the first speaker line is
/// ignored.
pub fn parse_turns(raw: &str) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    let mut current: Option<Turn> = None;

    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some((speaker, text)) = split_speaker_line(line) {
            if let Some(turn) = current.take().filter(|t| !t.text.is_empty()) {
                turns.push(turn);
            }
            current = Some(Turn {
                speaker,
                text: text.to_string(),
            });
        } else if let Some(turn) = current.as_mut() {
            if !turn.text.is_empty() {
                turn.text.push(' ');
            }
            turn.text.push_str(line);
        }
    }
    if let Some(turn) = current.filter(|t| !t.text.is_empty()) {
        turns.push(turn);
    }
    turns
}

/// Number of distinct voices a script needs.
///
/// 0-based ids count up to the highest id, 1-based ids count unique ids.
pub fn detect_speaker_count(raw: &str) -> usize {
    let ids: BTreeSet<usize> = raw
        .lines()
        .filter_map(|line| split_speaker_line(line.trim()).map(|(id, _)| id))
        .collect();

    match (ids.first().copied(), ids.last().copied()) {
        (Some(0), Some(max)) => max + 1,
        (Some(_), Some(_)) => ids.len(),
        _ => 1,
    }
}

/// A ready-made script offered to front-ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExampleScript {
    pub name: String,
    pub num_speakers: usize,
    pub script: String,
}

/// Load every `.txt` script in `dir`, sorted by file name, with blank
/// lines removed. A missing directory yields an empty catalogue.
pub fn load_example_scripts<P: AsRef<Path>>(dir: P) -> Vec<ExampleScript> {
    let dir = dir.as_ref();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "Example scripts directory not readable: {e}");
            return Vec::new();
        }
    };
    let mut paths: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("txt"))
        })
        .collect();
    paths.sort();

    let mut examples = Vec::new();
    for path in paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        if let Some(minutes) = advertised_minutes(&name).filter(|m| *m > MAX_EXAMPLE_MINUTES) {
            info!("Skipping {name}: duration {minutes} minutes exceeds {MAX_EXAMPLE_MINUTES}-minute limit");
            continue;
        }
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Error loading example script {name}: {e}");
                continue;
            }
        };
        let script = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if script.is_empty() {
            continue;
        }
        let num_speakers = detect_speaker_count(&script);
        info!("Loaded example: {name} with {num_speakers} speakers");
        examples.push(ExampleScript {
            name,
            num_speakers,
            script,
        });
    }
    examples
}

/// Minutes in a file name such as `talk_45min.txt`.
fn advertised_minutes(file_name: &str) -> Option<u32> {
    let lower = file_name.to_ascii_lowercase();
    let at = lower.find("min")?;
    let digits: String = lower[..at]
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return advertised_minutes(&lower[at + 3..]);
    }
    digits.parse().ok()
}

/// Split `Speaker N: text` (case-insensitive keyword) into `(N, text)`.
fn split_speaker_line(line: &str) -> Option<(usize, &str)> {
    let keyword = line.get(..7)?;
    if !keyword.eq_ignore_ascii_case("speaker") {
        return None;
    }
    let rest = &line[7..];
    let after_ws = rest.trim_start();
    if after_ws.len() == rest.len() {
        return None;
    }
    let digits_end = after_ws
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(after_ws.len());
    if digits_end == 0 {
        return None;
    }
    let id = after_ws[..digits_end].parse().ok()?;
    let text = after_ws[digits_end..].trim_start().strip_prefix(':')?;
    Some((id, text.trim()))
}
