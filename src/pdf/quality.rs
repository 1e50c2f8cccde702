//! Cheap, explainable heuristics to score extraction quality.
//!
//! The score gates the pipeline: a guide proceeds to parsing only when
//! `confidence >= 0.20` and the document does not look scanned.

use std::sync::OnceLock;

use regex::{Regex, RegexSet};

/// Quality signals and the derived confidence for one extraction.
#[derive(Debug, Clone)]
pub struct QualityReport {
    /// Confidence in `[0, 0.95]`, rounded to 3 decimals.
    pub confidence: f64,
    /// Total characters extracted.
    pub char_count: usize,
    /// `\w+` token count.
    pub word_count: usize,
    /// Newline-delimited line count.
    pub line_count: usize,
    /// Fraction of ASCII-printable characters, rounded to 3 decimals.
    pub printable_ratio: f64,
    /// Leveling/matrix vocabulary detected.
    pub has_matrix_signals: bool,
    /// Table layout vocabulary detected.
    pub has_table_signals: bool,
    /// No page produced text, or fewer than 200 characters total.
    pub is_scanned_likely: bool,
    /// Non-empty but printable ratio below 0.85.
    pub is_garbled_likely: bool,
    /// Human-readable explanations for the score.
    pub notes: Vec<String>,
}

fn matrix_signals() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([
            r"\blevel\b",
            r"\bcompetenc(y|ies)\b",
            r"\bscope\b",
            r"\bexpectation(s)?\b",
            r"\bresponsibilit(y|ies)\b",
            r"\bbehavior(s)?\b",
        ])
        .expect("matrix signal patterns are valid")
    })
}

fn table_signals() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new([r"\btable\b", r"\brow\b", r"\bcolumn\b", r"\|"])
            .expect("table signal patterns are valid")
    })
}

fn word_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+").expect("word pattern is valid"))
}

#[allow(clippy::cast_precision_loss)]
fn printable_ratio(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }
    let good = text
        .chars()
        .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace())
        .count();
    let total = text.chars().count().max(1);
    good as f64 / total as f64
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Score an extraction. Deterministic; bounded to `[0, 0.95]`.
pub fn score_extraction(text: &str, _page_count: usize, pages_with_text: usize) -> QualityReport {
    let char_count = text.chars().count();
    let word_count = word_pattern().find_iter(text).count();
    let line_count = text.matches('\n').count() + usize::from(!text.is_empty());
    let printable = printable_ratio(text);

    let lower = text.to_lowercase();
    let has_matrix_signals = matrix_signals().is_match(&lower);
    let has_table_signals = table_signals().is_match(&lower);

    let is_scanned_likely = pages_with_text == 0 || char_count < 200;
    let is_garbled_likely = char_count > 0 && printable < 0.85;

    let mut notes: Vec<String> = Vec::new();
    let mut confidence: f64;

    if char_count < 800 || pages_with_text == 0 {
        confidence = 0.10;
        if pages_with_text == 0 {
            notes.push("No pages had extractable text".to_string());
        }
        if char_count < 800 {
            notes.push("Extracted text is very small".to_string());
        }
    } else if char_count <= 2500 {
        confidence = 0.40;
        notes.push("Moderate text volume".to_string());
    } else {
        confidence = 0.80;
        notes.push("High text volume".to_string());
    }

    if has_matrix_signals && char_count > 2500 {
        confidence = (confidence + 0.15).min(0.95);
        notes.push("Detected leveling/matrix signals".to_string());
    } else if has_matrix_signals {
        confidence = (confidence + 0.10).min(0.85);
        notes.push("Detected some matrix signals".to_string());
    }

    if is_garbled_likely {
        confidence = (confidence - 0.25).max(0.05);
        notes.push("Text looks garbled (low printable ratio)".to_string());
    }

    if has_table_signals {
        confidence = (confidence + 0.05).min(0.95);
        notes.push("Detected possible table signals".to_string());
    }

    if is_scanned_likely {
        confidence = confidence.min(0.10);
        notes.push("Looks like scanned/empty PDF (no embedded text)".to_string());
    }

    QualityReport {
        confidence: round3(confidence),
        char_count,
        word_count,
        line_count,
        printable_ratio: round3(printable),
        has_matrix_signals,
        has_table_signals,
        is_scanned_likely,
        is_garbled_likely,
        notes,
    }
}
