//! Compile-time prompt registry.
//!
//! Templates are addressed by `(name, version)`; an unknown pair fails fast
//! as non-retryable. Placeholders use `{{key}}` syntax. The reserved
//! `{{__REPAIR_INSTRUCTIONS__}}` placeholder defaults to empty and is
//! filled in by the client during a repair round-trip.

use std::collections::BTreeMap;

use super::LlmError;

/// Reserved variable injected by the repair round-trip.
pub const REPAIR_INSTRUCTIONS_KEY: &str = "__REPAIR_INSTRUCTIONS__";

/// A named, versioned prompt template.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    /// Registry name.
    pub name: &'static str,
    /// Registry version.
    pub version: &'static str,
    /// Template body with `{{key}}` placeholders.
    pub template: &'static str,
}

static PARSE_MATRIX_V1: PromptTemplate = PromptTemplate {
    name: "parse_matrix",
    version: "v1",
    template: r#"You are extracting a leveling guide matrix from text.
Return STRICT JSON only.

Rules:
- If you cannot confidently extract, set "confidence" < 0.6 and explain in "notes".
- Do not hallucinate missing rows/columns.
- Keep labels exactly as in the text.
- Keep each cell under 350 characters.
- Escape all quotes and newlines inside string values.

Return JSON with shape:
{
  "confidence": 0.0-1.0,
  "role": "string|null",
  "levels": ["string", ...],
  "competencies": [
    {
      "name": "string",
      "cells": {
        "<level>": "string"
      }
    }
  ],
  "notes": "string"
}

TEXT:
{{text}}

{{__REPAIR_INSTRUCTIONS__}}"#,
};

static GENERATE_EXAMPLES_BATCH_V1: PromptTemplate = PromptTemplate {
    name: "generate_examples_batch",
    version: "v1",
    template: r#"You are generating concrete behavioral examples for leveling guide cells.

Base context:
{{base_context}}

Role:
{{role}}

Level:
{{level}}

Input cells (JSON array of {"competency", "cell_text"}):
{{items_json}}

Return STRICT JSON only:
{
  "level": "{{level}}",
  "results": [
    {
      "competency": "string",
      "examples": [
        {"title": "string", "example": "string"},
        {"title": "string", "example": "string"},
        {"title": "string", "example": "string"}
      ]
    }
  ]
}

Constraints:
- Return exactly one entry per input competency, using the competency name verbatim.
- Exactly 3 examples per competency, each with a non-empty title and example.
- Keep each example 2-4 sentences, concrete and realistic.
- Do NOT name any company, product, or technology unless it appears verbatim in the base context or cell_text.
- The 3 examples per competency must be clearly distinct from each other.
- Escape all quotes and newlines inside string values.

{{__REPAIR_INSTRUCTIONS__}}"#,
};

static SMOKE_TEST_V1: PromptTemplate = PromptTemplate {
    name: "smoke_test",
    version: "v1",
    template: r#"Return exactly this JSON:
{"ok": true}

{{__REPAIR_INSTRUCTIONS__}}"#,
};

/// Look up a template by `(name, version)`.
///
/// # Errors
///
/// Returns [`LlmError::NonRetryable`] for unknown pairs — a wrong prompt
/// identity is a programming error, not a transient condition.
pub fn get_prompt(name: &str, version: &str) -> Result<&'static PromptTemplate, LlmError> {
    match (name, version) {
        ("parse_matrix", "v1") => Ok(&PARSE_MATRIX_V1),
        ("generate_examples_batch", "v1") => Ok(&GENERATE_EXAMPLES_BATCH_V1),
        ("smoke_test", "v1") => Ok(&SMOKE_TEST_V1),
        _ => Err(LlmError::NonRetryable(format!(
            "unknown prompt: {name}@{version}"
        ))),
    }
}

/// Substitute `{{key}}` placeholders with string-coerced values.
///
/// Unknown placeholders are left untouched; the registry templates only
/// reference keys their callers provide.
pub fn render(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in variables {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}
