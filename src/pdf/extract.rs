//! Extraction engines.
//!
//! Preferred strategy:
//! 1) `lopdf` — per-page text, so `pages_with_text` is exact
//! 2) `pdf-extract` — whole-document fallback without page granularity

use thiserror::Error;

use super::ExtractedPdf;

/// Errors from the extraction chain.
#[derive(Debug, Error)]
pub enum PdfError {
    /// Zero-byte payload.
    #[error("empty PDF payload")]
    Empty,
    /// Every engine failed to read the document.
    #[error("no extraction engine could read the document: {0}")]
    Unreadable(String),
}

/// Deterministic PDF-to-text extraction.
pub trait PdfExtractor: Send + Sync {
    /// Extract text from raw PDF bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PdfError`] when the payload is empty or unreadable by
    /// every engine.
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedPdf, PdfError>;
}

/// The production engine chain: `lopdf` first, `pdf-extract` on failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPdfExtractor;

impl PdfExtractor for DefaultPdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<ExtractedPdf, PdfError> {
        if bytes.is_empty() {
            return Err(PdfError::Empty);
        }

        match extract_with_lopdf(bytes) {
            Ok(extracted) => Ok(extracted),
            Err(primary_err) => extract_with_pdf_extract(bytes).map_err(|fallback_err| {
                PdfError::Unreadable(format!("lopdf: {primary_err}; pdf-extract: {fallback_err}"))
            }),
        }
    }
}

fn extract_with_lopdf(bytes: &[u8]) -> Result<ExtractedPdf, lopdf::Error> {
    let doc = lopdf::Document::load_mem(bytes)?;
    let pages = doc.get_pages();
    let page_count = pages.len();

    let mut texts: Vec<String> = Vec::with_capacity(page_count);
    let mut pages_with_text = 0usize;
    for page_number in pages.keys() {
        // A page whose content stream cannot be decoded counts as empty
        // rather than failing the whole document.
        let text = doc.extract_text(&[*page_number]).unwrap_or_default();
        if !text.trim().is_empty() {
            pages_with_text += 1;
        }
        texts.push(text);
    }

    Ok(ExtractedPdf {
        text: texts.join("\n\n"),
        page_count,
        pages_with_text,
        strategy: "lopdf",
    })
}

fn extract_with_pdf_extract(bytes: &[u8]) -> Result<ExtractedPdf, pdf_extract::OutputError> {
    let text = pdf_extract::extract_text_from_mem(bytes)?;
    // Whole-document extraction: page granularity is lost, so the counts
    // collapse to document-level presence of text.
    let has_text = !text.trim().is_empty();
    Ok(ExtractedPdf {
        text,
        page_count: 1,
        pages_with_text: usize::from(has_text),
        strategy: "pdf-extract",
    })
}
