//! Deterministic PDF text extraction and quality scoring.
//!
//! No OCR: if a PDF carries no embedded text it is flagged as likely
//! scanned and the guide fails the quality gate. Extraction engines sit
//! behind the [`PdfExtractor`] trait so tests can substitute a fake.

pub mod extract;
pub mod quality;

pub use extract::{DefaultPdfExtractor, PdfError, PdfExtractor};
pub use quality::{score_extraction, QualityReport};

/// Output of one extraction attempt.
#[derive(Debug, Clone)]
pub struct ExtractedPdf {
    /// Concatenated page text, pages separated by blank lines.
    pub text: String,
    /// Total page count.
    pub page_count: usize,
    /// Pages that produced non-whitespace text.
    pub pages_with_text: usize,
    /// Which engine produced this result.
    pub strategy: &'static str,
}
