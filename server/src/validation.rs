use stream_core::voices::VoiceMap;
use stream_core::MAX_SPEAKERS;

use crate::error::ApiError;

/// Maximum script length for generation requests
const MAX_SCRIPT_LENGTH: usize = 20_000;
pub const MIN_CFG_SCALE: f32 = 1.0;
pub const MAX_CFG_SCALE: f32 = 2.0;
pub const DEFAULT_CFG_SCALE: f32 = 1.3;
/// Largest accepted voice upload, in decoded bytes.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
/// Request body limit for uploads: the base64 form of the largest upload
/// plus room for the other JSON fields.
pub const MAX_UPLOAD_BODY_BYTES: usize = MAX_UPLOAD_BYTES / 3 * 4 + 64 * 1024;

/// Validate a generation request against the current voice snapshot.
/// Returns the effective CFG scale.
pub fn validate_generate_request(
    script: &str,
    speakers: &[String],
    cfg_scale: Option<f32>,
    voices: &VoiceMap,
) -> Result<f32, ApiError> {
    if script.trim().is_empty() {
        return Err(ApiError::InvalidInput("Please provide a script.".to_string()));
    }
    if script.chars().count() > MAX_SCRIPT_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Script too long (max {} characters)",
            MAX_SCRIPT_LENGTH
        )));
    }

    if speakers.is_empty() || speakers.len() > MAX_SPEAKERS {
        return Err(ApiError::InvalidInput(format!(
            "Number of speakers must be between 1 and {}, got {}",
            MAX_SPEAKERS,
            speakers.len()
        )));
    }
    for (i, name) in speakers.iter().enumerate() {
        if name.trim().is_empty() {
            return Err(ApiError::InvalidInput(format!(
                "Please select a valid speaker for Speaker {}.",
                i + 1
            )));
        }
        if !voices.contains_key(name) {
            return Err(ApiError::NotFound(format!("Voice '{name}' not found")));
        }
    }

    let cfg_scale = cfg_scale.unwrap_or(DEFAULT_CFG_SCALE);
    if !(MIN_CFG_SCALE..=MAX_CFG_SCALE).contains(&cfg_scale) {
        return Err(ApiError::InvalidInput(format!(
            "cfg_scale must be between {MIN_CFG_SCALE} and {MAX_CFG_SCALE}, got {cfg_scale}"
        )));
    }
    Ok(cfg_scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn voices() -> VoiceMap {
        ["Alice", "Bob"]
            .into_iter()
            .map(|n| (n.to_string(), PathBuf::from(format!("{n}.wav"))))
            .collect()
    }

    fn speakers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_validate_generate_request_valid() {
        let cfg = validate_generate_request("Hello", &speakers(&["Alice", "Bob"]), None, &voices()).unwrap();
        assert_eq!(cfg, DEFAULT_CFG_SCALE);
        let cfg = validate_generate_request("Hello", &speakers(&["Bob"]), Some(2.0), &voices()).unwrap();
        assert_eq!(cfg, 2.0);
    }

    #[test]
    fn test_validate_generate_request_empty_script() {
        let result = validate_generate_request("  \n", &speakers(&["Alice"]), None, &voices());
        assert!(matches!(result, Err(ApiError::InvalidInput(msg)) if msg.contains("script")));
    }

    #[test]
    fn test_validate_generate_request_too_long() {
        let long_script = "a".repeat(MAX_SCRIPT_LENGTH + 1);
        let result = validate_generate_request(&long_script, &speakers(&["Alice"]), None, &voices());
        assert!(matches!(result, Err(ApiError::InvalidInput(msg)) if msg.contains("too long")));
    }

    #[test]
    fn test_validate_generate_request_speakers() {
        assert!(validate_generate_request("Hi", &[], None, &voices()).is_err());
        let five = speakers(&["Alice"; 5]);
        assert!(validate_generate_request("Hi", &five, None, &voices()).is_err());
        assert!(matches!(
            validate_generate_request("Hi", &speakers(&["Carol"]), None, &voices()),
            Err(ApiError::NotFound(_))
        ));
        assert!(validate_generate_request("Hi", &speakers(&[" "]), None, &voices()).is_err());
    }

    #[test]
    fn test_validate_generate_request_cfg_scale() {
        let names = speakers(&["Alice"]);
        assert!(validate_generate_request("Hi", &names, Some(0.9), &voices()).is_err());
        assert!(validate_generate_request("Hi", &names, Some(2.1), &voices()).is_err());
        assert!(validate_generate_request("Hi", &names, Some(f32::NAN), &voices()).is_err());
        assert!(validate_generate_request("Hi", &names, Some(1.0), &voices()).is_ok());
    }
}
