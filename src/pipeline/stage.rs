/*!
 * The fixed stage sequence of a dubbing pipeline.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::database::models::TaskStatus;

/// One of the six pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Downloading,
    Extracting,
    Transcribing,
    Translating,
    Synthesizing,
    Merging,
}

impl Stage {
    /// All stages in execution order
    pub const ALL: [Stage; 6] = [
        Stage::Downloading,
        Stage::Extracting,
        Stage::Transcribing,
        Stage::Translating,
        Stage::Synthesizing,
        Stage::Merging,
    ];

    /// Zero-based position in the sequence
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Persisted stage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Downloading => "downloading",
            Stage::Extracting => "extracting",
            Stage::Transcribing => "transcribing",
            Stage::Translating => "translating",
            Stage::Synthesizing => "synthesizing",
            Stage::Merging => "merging",
        }
    }

    /// Task status while this stage runs
    pub fn task_status(&self) -> TaskStatus {
        match self {
            Stage::Downloading => TaskStatus::Downloading,
            Stage::Extracting => TaskStatus::Extracting,
            Stage::Transcribing => TaskStatus::Transcribing,
            Stage::Translating => TaskStatus::Translating,
            Stage::Synthesizing => TaskStatus::Synthesizing,
            Stage::Merging => TaskStatus::Merging,
        }
    }

    /// Error code recorded when the stage fails as a whole
    pub fn failure_code(&self) -> &'static str {
        match self {
            Stage::Downloading => "E_DOWNLOAD_FAILED",
            Stage::Extracting => "E_EXTRACT_FAILED",
            Stage::Transcribing => "E_TRANSCRIBE_FAILED",
            Stage::Translating => "E_TRANSLATE_FAILED",
            Stage::Synthesizing => "E_TTS_FAILED",
            Stage::Merging => "E_MERGE_FAILED",
        }
    }

    /// Whether the stage works through segments
    pub fn is_segmented(&self) -> bool {
        matches!(self, Stage::Translating | Stage::Synthesizing)
    }

    /// Code stored on a failed segment, and the stage code it is promoted to
    pub fn segment_codes(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Stage::Translating => Some(("E_TRANSLATE_SEGMENT", "E_TRANSLATE_SEGMENT_FAILED")),
            Stage::Synthesizing => Some(("E_TTS_SEGMENT", "E_TTS_SEGMENT_FAILED")),
            _ => None,
        }
    }

    /// Stages from this one to the end
    pub fn remaining(&self) -> &'static [Stage] {
        &Stage::ALL[self.index()..]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown stage: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_shouldMatchIndex() {
        for (position, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), position);
        }
        assert!(Stage::Translating < Stage::Synthesizing);
    }

    #[test]
    fn test_remaining_fromTranslating_shouldSkipEarlierStages() {
        assert_eq!(
            Stage::Translating.remaining(),
            &[Stage::Translating, Stage::Synthesizing, Stage::Merging]
        );
    }

    #[test]
    fn test_fromStr_unknownStage_shouldFail() {
        assert_eq!("merging".parse::<Stage>().unwrap(), Stage::Merging);
        assert!("uploading".parse::<Stage>().is_err());
    }
}
