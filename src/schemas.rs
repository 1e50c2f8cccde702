//! Wire types: LLM structured-output schemas and API response payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Parse phase
// ---------------------------------------------------------------------------

/// One matrix row as parsed by the LLM. `cells` maps level label to the
/// definition text; missing levels are simply absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedCompetency {
    pub name: String,
    #[serde(default)]
    pub cells: BTreeMap<String, String>,
}

/// The structured output of `parse_matrix@v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedMatrix {
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub levels: Vec<String>,
    #[serde(default)]
    pub competencies: Vec<ParsedCompetency>,
    #[serde(default)]
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Generate phase
// ---------------------------------------------------------------------------

/// One generated behavioral example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedExample {
    pub title: String,
    pub example: String,
}

/// The three examples for one competency at one level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetencyExamples {
    pub competency: String,
    #[serde(default)]
    pub examples: Vec<GeneratedExample>,
}

/// The structured output of `generate_examples_batch@v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateExamplesBatchResult {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub results: Vec<CompetencyExamples>,
}

// ---------------------------------------------------------------------------
// API payloads
// ---------------------------------------------------------------------------

/// Response to a guide upload (the `POST /api/guides` contract).
#[derive(Debug, Clone, Serialize)]
pub struct GuideCreateResponse {
    pub guide_id: String,
    pub company_id: String,
    pub status: String,
    pub status_url: String,
    pub results_url: String,
    pub pdf_url: String,
    pub created_at: String,
}

/// Response to a status poll (the `GET /status` contract).
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub guide_id: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Generation progress counters.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    /// `|levels| x |competencies|`.
    pub expected: i64,
    /// SUCCESS generation rows.
    pub completed: i64,
}

/// A level column in the rendered matrix.
#[derive(Debug, Clone, Serialize)]
pub struct LevelOut {
    pub id: String,
    pub label: String,
    pub position: i64,
}

/// One rendered cell with its generation outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CellOut {
    pub level_id: String,
    pub cell_id: Option<String>,
    pub definition_text: Option<String>,
    pub examples: Vec<GeneratedExample>,
    /// `SUCCESS`, `FAILED`, `PENDING`, or `MISSING_CELL`.
    pub generation_status: String,
}

/// A competency row with its cells in level order.
#[derive(Debug, Clone, Serialize)]
pub struct CompetencyOut {
    pub id: String,
    pub name: String,
    pub position: i64,
    pub cells: Vec<CellOut>,
}

/// The rendered matrix (the `GET /results` contract).
#[derive(Debug, Clone, Serialize)]
pub struct GuideResults {
    pub guide_id: String,
    pub status: String,
    pub prompt_version: String,
    pub progress: Progress,
    pub levels: Vec<LevelOut>,
    pub competencies: Vec<CompetencyOut>,
}
