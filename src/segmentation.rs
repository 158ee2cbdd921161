/*!
 * Text segmentation for the translate and synthesize stages.
 *
 * Splits a transcript or translation into ordered chunks that are small
 * enough to send to a provider one at a time:
 * - punctuation: clause and sentence marks, packed up to a character budget
 * - sentence: sentence-ending marks only, packed toward a target length
 * - duration: punctuation packing at a budget derived from speaking time
 *
 * All budgets count characters, not bytes.
 */

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::PipelineError;

/// Default maximum characters per chunk for the punctuation strategy
pub const DEFAULT_MAX_CHARS_PER_SEGMENT: usize = 220;
const MIN_MAX_CHARS_PER_SEGMENT: usize = 40;

/// Default target chunk length for the sentence strategy
pub const DEFAULT_TARGET_SEGMENT_LENGTH: usize = 260;
const MIN_TARGET_SEGMENT_LENGTH: usize = 60;

/// Default speaking time per chunk for the duration strategy
pub const DEFAULT_TARGET_DURATION_SEC: f64 = 8.0;
const MIN_TARGET_DURATION_SEC: f64 = 4.0;

/// Speaking-rate heuristic used by the duration strategy
const CHARS_PER_SECOND: f64 = 4.0;

/// A piece is a run of text up to and including a run of clause or sentence marks
static CLAUSE_PIECES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^。！？；，、,.!?;:：…\n]*[。！？；，、,.!?;:：…\n]+|[^。！？；，、,.!?;:：…\n]+")
        .expect("clause pattern is valid")
});

static SENTENCE_PIECES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[^。！？.!?…\n]*[。！？.!?…\n]+|[^。！？.!?…\n]+")
        .expect("sentence pattern is valid")
});

/// How text is cut into chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationStrategy {
    #[default]
    Punctuation,
    Sentence,
    Duration,
}

impl fmt::Display for SegmentationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentationStrategy::Punctuation => write!(f, "punctuation"),
            SegmentationStrategy::Sentence => write!(f, "sentence"),
            SegmentationStrategy::Duration => write!(f, "duration"),
        }
    }
}

impl FromStr for SegmentationStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "punctuation" => Ok(SegmentationStrategy::Punctuation),
            "sentence" => Ok(SegmentationStrategy::Sentence),
            "duration" => Ok(SegmentationStrategy::Duration),
            _ => Err(anyhow::anyhow!("Invalid segmentation strategy: {}", s)),
        }
    }
}

/// Strategy tuning; unset values fall back to the strategy defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationOptions {
    pub max_chars_per_segment: Option<usize>,
    pub target_segment_length: Option<usize>,
    pub target_duration_sec: Option<f64>,
}

/// One chunk of segmented text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentChunk {
    /// Fresh identifier
    pub id: String,
    /// Zero-based position in emission order
    pub index: usize,
    pub text: String,
}

/// The character budget a strategy enforces, after applying floors
pub fn char_budget(strategy: SegmentationStrategy, options: &SegmentationOptions) -> usize {
    match strategy {
        SegmentationStrategy::Punctuation => options
            .max_chars_per_segment
            .unwrap_or(DEFAULT_MAX_CHARS_PER_SEGMENT)
            .max(MIN_MAX_CHARS_PER_SEGMENT),
        SegmentationStrategy::Sentence => options
            .target_segment_length
            .unwrap_or(DEFAULT_TARGET_SEGMENT_LENGTH)
            .max(MIN_TARGET_SEGMENT_LENGTH),
        SegmentationStrategy::Duration => {
            let seconds = options
                .target_duration_sec
                .filter(|s| s.is_finite())
                .unwrap_or(DEFAULT_TARGET_DURATION_SEC)
                .max(MIN_TARGET_DURATION_SEC);
            (seconds * CHARS_PER_SECOND).round() as usize
        }
    }
}

/// Segment text into ordered, trimmed, non-empty chunks
pub fn segment(
    text: &str,
    strategy: SegmentationStrategy,
    options: &SegmentationOptions,
) -> Vec<SegmentChunk> {
    let budget = char_budget(strategy, options);

    let pieces = match strategy {
        SegmentationStrategy::Punctuation => pack(split_pieces(&CLAUSE_PIECES, text), budget),
        SegmentationStrategy::Sentence => pack(split_pieces(&SENTENCE_PIECES, text), budget),
        SegmentationStrategy::Duration => {
            let clause_options = SegmentationOptions {
                max_chars_per_segment: Some(budget),
                ..Default::default()
            };
            let clause_budget = char_budget(SegmentationStrategy::Punctuation, &clause_options);
            pack(split_pieces(&CLAUSE_PIECES, text), clause_budget)
                .into_iter()
                .flat_map(|chunk| hard_split(&chunk, budget))
                .collect()
        }
    };

    let chunks: Vec<SegmentChunk> = pieces
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(index, text)| SegmentChunk {
            id: Uuid::new_v4().to_string(),
            index,
            text: text.to_string(),
        })
        .collect();

    debug!(
        "Segmented {} chars into {} chunks ({} strategy, budget {})",
        text.chars().count(),
        chunks.len(),
        strategy,
        budget
    );

    chunks
}

/// Remove every whitespace character
///
/// Chunk boundaries may add or drop whitespace (trimming, hard splits inside
/// words), and scripts such as CJK carry no word spacing, so text is compared
/// with all whitespace removed.
pub fn normalize_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Check that the chunks reproduce the original text
pub fn assert_segment_integrity(
    original: &str,
    chunks: &[SegmentChunk],
) -> Result<(), PipelineError> {
    let joined = chunks
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let expected = normalize_whitespace(original);
    let actual = normalize_whitespace(&joined);
    if expected == actual {
        return Ok(());
    }

    let expected_len = expected.chars().count();
    let actual_len = actual.chars().count();
    let first_mismatch = expected
        .chars()
        .zip(actual.chars())
        .position(|(a, b)| a != b)
        .unwrap_or(expected_len.min(actual_len));

    Err(PipelineError::Integrity(format!(
        "expected {} chars, got {} (first difference at char {})",
        expected_len, actual_len, first_mismatch
    )))
}

fn split_pieces<'a>(pattern: &Regex, text: &'a str) -> Vec<&'a str> {
    pattern.find_iter(text).map(|m| m.as_str()).collect()
}

/// Greedily pack pieces into chunks of at most `budget` characters
fn pack(pieces: Vec<&str>, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    let sized = pieces.into_iter().flat_map(|piece| hard_split(piece, budget));

    for piece in sized {
        let piece_len = piece.chars().count();
        if current_len + piece_len > budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(&piece);
        current_len += piece_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Slice text into pieces of at most `budget` characters
fn hard_split(text: &str, budget: usize) -> Vec<String> {
    if budget == 0 || text.chars().count() <= budget {
        return vec![text.to_string()];
    }

    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(budget)
        .map(|slice| slice.iter().collect::<String>())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "A, B. C! D",
        "Hello world. This is a longer sentence, with a clause; and another one! Does it split? Yes.",
        "第一句话。第二句话，还有逗号、顿号；以及问号？最后是感叹号！",
        "no punctuation at all but quite a lot of words that keep going and going past any reasonable budget for a single chunk",
        "line one\nline two\n\nline three",
        "   leading and trailing whitespace   ",
        "",
    ];

    fn all_strategies() -> Vec<(SegmentationStrategy, SegmentationOptions)> {
        vec![
            (SegmentationStrategy::Punctuation, SegmentationOptions::default()),
            (
                SegmentationStrategy::Punctuation,
                SegmentationOptions {
                    max_chars_per_segment: Some(5),
                    ..Default::default()
                },
            ),
            (SegmentationStrategy::Sentence, SegmentationOptions::default()),
            (
                SegmentationStrategy::Sentence,
                SegmentationOptions {
                    target_segment_length: Some(60),
                    ..Default::default()
                },
            ),
            (SegmentationStrategy::Duration, SegmentationOptions::default()),
            (
                SegmentationStrategy::Duration,
                SegmentationOptions {
                    target_duration_sec: Some(1.0),
                    ..Default::default()
                },
            ),
        ]
    }

    #[test]
    fn test_segment_anyStrategy_shouldPreserveText() {
        for text in SAMPLES {
            for (strategy, options) in all_strategies() {
                let chunks = segment(text, strategy, &options);
                assert!(
                    assert_segment_integrity(text, &chunks).is_ok(),
                    "integrity failed for {:?} with {}",
                    text,
                    strategy
                );
            }
        }
    }

    #[test]
    fn test_segment_anyStrategy_shouldRespectBudget() {
        for text in SAMPLES {
            for (strategy, options) in all_strategies() {
                let budget = char_budget(strategy, &options);
                for chunk in segment(text, strategy, &options) {
                    assert!(
                        chunk.text.chars().count() <= budget,
                        "chunk {:?} exceeds {} for {}",
                        chunk.text,
                        budget,
                        strategy
                    );
                }
            }
        }
    }

    #[test]
    fn test_segment_shortClauses_smallMax_shouldStayWithinBound() {
        let options = SegmentationOptions {
            max_chars_per_segment: Some(5),
            ..Default::default()
        };
        let chunks = segment("A, B. C! D", SegmentationStrategy::Punctuation, &options);

        assert!(!chunks.is_empty());
        let budget = char_budget(SegmentationStrategy::Punctuation, &options);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= budget));
        let joined: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            normalize_whitespace(&joined.join(" ")),
            normalize_whitespace("A, B. C! D")
        );
    }

    #[test]
    fn test_segment_shouldAssignSequentialIndicesAndUniqueIds() {
        let text = "One. Two. Three. ".repeat(40);
        let chunks = segment(&text, SegmentationStrategy::Sentence, &SegmentationOptions::default());

        assert!(chunks.len() > 1);
        for (position, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, position);
            assert!(!chunk.text.is_empty());
            assert_eq!(chunk.text, chunk.text.trim());
        }
        let mut ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), chunks.len());
    }

    #[test]
    fn test_segment_oversizedPiece_shouldHardSplit() {
        let text = "x".repeat(100);
        let options = SegmentationOptions {
            max_chars_per_segment: Some(40),
            ..Default::default()
        };
        let chunks = segment(&text, SegmentationStrategy::Punctuation, &options);

        let lengths: Vec<usize> = chunks.iter().map(|c| c.text.len()).collect();
        assert_eq!(lengths, vec![40, 40, 20]);
    }

    #[test]
    fn test_segment_whitespaceOnly_shouldProduceNoChunks() {
        let chunks = segment("  \n\n  ", SegmentationStrategy::Punctuation, &SegmentationOptions::default());
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_charBudget_shouldApplyFloorsAndDefaults() {
        let defaults = SegmentationOptions::default();
        assert_eq!(char_budget(SegmentationStrategy::Punctuation, &defaults), 220);
        assert_eq!(char_budget(SegmentationStrategy::Sentence, &defaults), 260);
        assert_eq!(char_budget(SegmentationStrategy::Duration, &defaults), 32);

        let tiny = SegmentationOptions {
            max_chars_per_segment: Some(1),
            target_segment_length: Some(1),
            target_duration_sec: Some(0.5),
        };
        assert_eq!(char_budget(SegmentationStrategy::Punctuation, &tiny), 40);
        assert_eq!(char_budget(SegmentationStrategy::Sentence, &tiny), 60);
        assert_eq!(char_budget(SegmentationStrategy::Duration, &tiny), 16);
    }

    #[test]
    fn test_assertSegmentIntegrity_droppedText_shouldFail() {
        let chunks = vec![SegmentChunk {
            id: "a".to_string(),
            index: 0,
            text: "Hello".to_string(),
        }];

        let result = assert_segment_integrity("Hello world", &chunks);
        assert!(matches!(result, Err(PipelineError::Integrity(_))));
    }

    #[test]
    fn test_strategy_shouldParseFromString() {
        assert_eq!(
            "Sentence".parse::<SegmentationStrategy>().unwrap(),
            SegmentationStrategy::Sentence
        );
        assert!("words".parse::<SegmentationStrategy>().is_err());
    }
}
