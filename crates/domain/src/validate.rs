//! Validation of client-supplied run parameters.
//!
//! Paths must stay inside the project root (relative, no `..` segments) and
//! carry an allowed extension. Language codes are ISO-639-shaped; the input
//! language additionally accepts the literal `auto`.

use std::path::{Component, Path, PathBuf};

/// Audio container extensions the transcription tool accepts.
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "wav", "flac", "m4a", "aac", "ogg", "opus", "wma", "aiff", "ape", "ac3",
];

/// Reject absolute paths, traversal segments, and empty input.
pub fn validate_relative_path(raw: &str) -> Result<(), String> {
    if raw.trim().is_empty() {
        return Err("path is empty".into());
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(format!("path must be relative: {raw}"));
    }
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(format!("path must not contain '..' segments: {raw}"));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!("path must be relative: {raw}"));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

fn extension_of(raw: &str) -> Option<String> {
    Path::new(raw)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// A relative path with one of the allowed audio extensions.
pub fn validate_audio_path(raw: &str) -> Result<(), String> {
    validate_relative_path(raw)?;
    match extension_of(raw) {
        Some(ext) if AUDIO_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        Some(ext) => Err(format!("unsupported audio extension '.{ext}': {raw}")),
        None => Err(format!("audio path has no extension: {raw}")),
    }
}

/// A relative path ending in `.docx` (templates and output documents).
pub fn validate_docx_path(raw: &str) -> Result<(), String> {
    validate_relative_path(raw)?;
    match extension_of(raw) {
        Some(ext) if ext == "docx" => Ok(()),
        _ => Err(format!("expected a .docx path: {raw}")),
    }
}

/// `auto` or an ISO language code.
pub fn validate_input_language(raw: &str) -> Result<(), String> {
    if raw == "auto" {
        return Ok(());
    }
    validate_language_code(raw)
}

/// An ISO language code; `auto` is not a valid output language.
pub fn validate_output_language(raw: &str) -> Result<(), String> {
    if raw == "auto" {
        return Err("output language must be a concrete ISO code, not 'auto'".into());
    }
    validate_language_code(raw)
}

/// ISO-639-shaped: 2–3 lowercase letters, optional `-Xx`/`-XXXX` subtag.
fn validate_language_code(raw: &str) -> Result<(), String> {
    let (primary, subtag) = match raw.split_once('-') {
        Some((p, s)) => (p, Some(s)),
        None => (raw, None),
    };

    let primary_ok = (2..=3).contains(&primary.len())
        && primary.chars().all(|c| c.is_ascii_lowercase());
    let subtag_ok = match subtag {
        None => true,
        Some(s) => (2..=4).contains(&s.len()) && s.chars().all(|c| c.is_ascii_alphabetic()),
    };

    if primary_ok && subtag_ok {
        Ok(())
    } else {
        Err(format!("not a valid language code: {raw}"))
    }
}

/// Join a validated relative path onto the project root.
pub fn resolve_within_root(root: &Path, relative: &str) -> Result<PathBuf, String> {
    validate_relative_path(relative)?;
    Ok(root.join(relative))
}
