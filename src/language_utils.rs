use anyhow::{Result, anyhow};
use isolang::Language;

// Language utilities for ISO language code handling.
//
// Target languages are accepted as ISO 639-1 (2-letter) or ISO 639-3
// (3-letter) codes. Provider prompts use the English name.

/// Resolve a language code to its isolang entry
pub fn parse_language_code(code: &str) -> Result<Language> {
    let normalized_code = code.trim().to_lowercase();

    let language = match normalized_code.len() {
        2 => Language::from_639_1(&normalized_code),
        3 => Language::from_639_3(&normalized_code),
        _ => None,
    };

    language.ok_or_else(|| anyhow!("Invalid language code: {}", code))
}

/// Get the English name for a language code
pub fn get_language_name(code: &str) -> Result<String> {
    Ok(parse_language_code(code)?.to_name().to_string())
}

/// Normalize a language code to ISO 639-1 where one exists, else ISO 639-3
pub fn normalize_language_code(code: &str) -> Result<String> {
    let language = parse_language_code(code)?;
    Ok(language
        .to_639_1()
        .map(str::to_string)
        .unwrap_or_else(|| language.to_639_3().to_string()))
}
