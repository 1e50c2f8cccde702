//! Guide status machine.
//!
//! Defines the legal guide states and transitions. The claim primitive that
//! enforces these transitions atomically against the database lives in
//! [`crate::repos::guide::claim_status`]; this module is the single source
//! of truth for which transitions are legal and which states are terminal.

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Lifecycle state of a guide. String encodings are stable and surfaced in
/// API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuideStatus {
    /// Created after upload, waiting for the extract worker.
    Queued,
    /// Extract worker holds the claim.
    ExtractingText,
    /// Text extracted and quality-gated; waiting for the parse worker.
    TextExtracted,
    /// Parse worker holds the claim.
    ParsingMatrix,
    /// Matrix normalized into levels/competencies/cells; waiting for kickoff.
    MatrixParsed,
    /// Generation chunks are in flight.
    GeneratingExamples,
    /// Terminal: every cell has a SUCCESS generation row.
    Done,
    /// Terminal: extraction quality below threshold (scanned or empty PDF).
    FailedBadPdf,
    /// Terminal: matrix parsing failed.
    FailedParse,
    /// Terminal: all cells reached an outcome, at least one FAILED.
    FailedGeneration,
}

impl GuideStatus {
    /// The stable string stored in the database and returned by the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::ExtractingText => "EXTRACTING_TEXT",
            Self::TextExtracted => "TEXT_EXTRACTED",
            Self::ParsingMatrix => "PARSING_MATRIX",
            Self::MatrixParsed => "MATRIX_PARSED",
            Self::GeneratingExamples => "GENERATING_EXAMPLES",
            Self::Done => "DONE",
            Self::FailedBadPdf => "FAILED_BAD_PDF",
            Self::FailedParse => "FAILED_PARSE",
            Self::FailedGeneration => "FAILED_GENERATION",
        }
    }

    /// Parse from the stored string value.
    ///
    /// # Errors
    ///
    /// Returns an internal error for unrecognized values; the column is only
    /// ever written from this enum, so an unknown value means a corrupt row.
    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "EXTRACTING_TEXT" => Ok(Self::ExtractingText),
            "TEXT_EXTRACTED" => Ok(Self::TextExtracted),
            "PARSING_MATRIX" => Ok(Self::ParsingMatrix),
            "MATRIX_PARSED" => Ok(Self::MatrixParsed),
            "GENERATING_EXAMPLES" => Ok(Self::GeneratingExamples),
            "DONE" => Ok(Self::Done),
            "FAILED_BAD_PDF" => Ok(Self::FailedBadPdf),
            "FAILED_PARSE" => Ok(Self::FailedParse),
            "FAILED_GENERATION" => Ok(Self::FailedGeneration),
            other => Err(AppError::internal(format!("unknown guide status: {other}"))),
        }
    }

    /// Whether this state ends the pipeline for the guide.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::FailedBadPdf | Self::FailedParse | Self::FailedGeneration
        )
    }

    /// Whether `from -> to` is a legal transition.
    ///
    /// Only the transitions in this table may ever be applied to a guide
    /// row; everything else — including any move out of a terminal state —
    /// is refused.
    pub fn can_transition(from: GuideStatus, to: GuideStatus) -> bool {
        matches!(
            (from, to),
            (Self::Queued, Self::ExtractingText)
                | (Self::ExtractingText, Self::TextExtracted)
                | (Self::ExtractingText, Self::FailedBadPdf)
                | (Self::TextExtracted, Self::ParsingMatrix)
                | (Self::ParsingMatrix, Self::MatrixParsed)
                | (Self::ParsingMatrix, Self::FailedParse)
                | (Self::MatrixParsed, Self::GeneratingExamples)
                | (Self::GeneratingExamples, Self::Done)
                | (Self::GeneratingExamples, Self::FailedGeneration)
        )
    }
}

impl std::fmt::Display for GuideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
