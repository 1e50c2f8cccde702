//! Generation phase: fan-out, the chunk executor, finalize, and the
//! rendered results view.
//!
//! Fan-in is implicit: finalize counts persisted generation rows instead of
//! joining on tasks, so no distributed coordination is needed.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::db::models::{Company, Guide, GuideCell};
use crate::errors::AppError;
use crate::llm::LlmError;
use crate::repos::{company, generation as gen_repo, guide as guide_repo, matrix};
use crate::schemas::{
    CellOut, CompetencyOut, GenerateExamplesBatchResult, GeneratedExample, GuideResults, LevelOut,
    Progress,
};
use crate::status::GuideStatus;

use super::PipelineContext;

/// Prompt identity for the generate phase; part of the idempotency key.
pub const PROMPT_NAME: &str = "generate_examples_batch";

/// Competency count per chunk when the matrix is large enough to split.
pub const DEFAULT_CHUNK_SIZE: usize = 6;

/// Technology terms the model may not introduce on its own. A term is
/// allowed only when it already appears in the base context or a cell text.
const DENYLIST: [&str; 18] = [
    "kafka",
    "kubernetes",
    "docker",
    "aws",
    "gcp",
    "azure",
    "spark",
    "datadog",
    "opentelemetry",
    "terraform",
    "helm",
    "postgres",
    "mysql",
    "mongodb",
    "grpc",
    "protobuf",
    "vault",
    "redis",
];

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of the kickoff executor.
#[derive(Debug, Clone, Serialize)]
pub struct KickoffOutcome {
    pub status: GuideStatus,
    pub tasks_enqueued: usize,
    pub levels: usize,
    pub competencies: usize,
    pub chunk_size: usize,
}

/// Result of one chunk executor run.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkOutcome {
    pub written: usize,
    pub skipped_reason: Option<&'static str>,
}

/// Result of one finalize poll.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeOutcome {
    pub status: GuideStatus,
    pub success: i64,
    pub failed: i64,
    pub total_cells: i64,
    pub total_rows: i64,
}

/// One input cell handed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkItem {
    pub competency: String,
    pub cell_text: String,
}

// ---------------------------------------------------------------------------
// Context and validation helpers
// ---------------------------------------------------------------------------

fn derive_company_name_from_url(website_url: &str) -> String {
    let host = Url::parse(website_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_default()
        .to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    let root = host.split('.').next().unwrap_or("").to_string();
    if root.is_empty() {
        return "Company".to_string();
    }
    let mut chars = root.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => "Company".to_string(),
    }
}

/// Concatenated facts the LLM may ground on, plus the no-guessing rule.
fn base_context(company: &Company, guide: &Guide) -> String {
    let mut parts: Vec<String> = Vec::new();

    let name = company
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| derive_company_name_from_url(&company.website_url));
    parts.push(format!("Company name: {name}"));
    parts.push(format!("Company website URL: {}", company.website_url.trim()));

    if let Some(context) = company.context.as_deref().map(str::trim) {
        if !context.is_empty() {
            parts.push(format!("Company context: {context}"));
        }
    }
    if let Some(role) = guide.role_title.as_deref().map(str::trim) {
        if !role.is_empty() {
            parts.push(format!("Role title: {role}"));
        }
    }

    parts.push(
        "Important: Do not guess company domain/products/technology stack from the URL. \
         If company context is missing, keep examples generic and grounded only in the \
         leveling guide cell text."
            .to_string(),
    );
    parts.join("\n")
}

/// Contiguous `[start, end)` ranges covering `n` items.
fn chunk_ranges(n: usize, chunk_size: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let step = chunk_size.max(1);
    let mut i = 0;
    while i < n {
        let j = (i + step).min(n);
        out.push((i, j));
        i = j;
    }
    out
}

fn whitespace_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace pattern is valid"))
}

fn sentence_split_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]+").expect("sentence pattern is valid"))
}

fn normalize_text(s: &str) -> String {
    whitespace_pattern()
        .replace_all(s.trim(), " ")
        .to_lowercase()
}

fn count_sentences(s: &str) -> usize {
    sentence_split_pattern()
        .split(s.trim())
        .filter(|part| !part.trim().is_empty())
        .count()
}

fn build_allowed_corpus(base_context: &str, items: &[ChunkItem]) -> String {
    let mut texts = vec![base_context.to_string()];
    for item in items {
        texts.push(item.competency.clone());
        texts.push(item.cell_text.clone());
    }
    texts.join("\n")
}

fn find_forbidden_terms(text: &str, allowed_corpus: &str) -> Vec<&'static str> {
    let out_lower = text.to_lowercase();
    let allowed_lower = allowed_corpus.to_lowercase();
    DENYLIST
        .iter()
        .copied()
        .filter(|term| out_lower.contains(term) && !allowed_lower.contains(term))
        .collect()
}

/// Semantic validation of one batch result, applied after schema binding.
fn validate_batch(
    result: &GenerateExamplesBatchResult,
    items: &[ChunkItem],
    base_context: &str,
) -> Result<(), String> {
    if result.results.is_empty() {
        return Err("Missing results in LLM output".to_string());
    }
    if result.results.len() != items.len() {
        return Err(format!(
            "Expected {} results, got {}",
            items.len(),
            result.results.len()
        ));
    }

    let got: Vec<&str> = result.results.iter().map(|r| r.competency.as_str()).collect();
    let missing: Vec<&str> = items
        .iter()
        .map(|it| it.competency.as_str())
        .filter(|c| !c.is_empty() && !got.contains(c))
        .collect();
    if !missing.is_empty() {
        return Err(format!("Missing competencies in output: {missing:?}"));
    }

    let allowed_corpus = build_allowed_corpus(base_context, items);

    for row in &result.results {
        if row.competency.is_empty() {
            return Err("Missing competency name in output".to_string());
        }
        if row.examples.len() != 3 {
            return Err(format!(
                "Competency '{}' must have exactly 3 examples",
                row.competency
            ));
        }

        let mut normalized: Vec<String> = Vec::with_capacity(3);
        for example in &row.examples {
            let title = example.title.trim();
            let body = example.example.trim();
            if title.is_empty() || body.is_empty() {
                return Err(format!(
                    "Empty title/example in competency '{}'",
                    row.competency
                ));
            }

            let sentences = count_sentences(body);
            if !(2..=5).contains(&sentences) {
                return Err(format!(
                    "Example length out of range (2-4 sentences) in '{}'",
                    row.competency
                ));
            }

            let forbidden = find_forbidden_terms(&format!("{title} {body}"), &allowed_corpus);
            if !forbidden.is_empty() {
                return Err(format!("Forbidden terms not present in inputs: {forbidden:?}"));
            }

            normalized.push(normalize_text(body));
        }

        normalized.sort_unstable();
        normalized.dedup();
        if normalized.len() != 3 {
            return Err(format!(
                "Duplicate/near-duplicate examples in competency '{}'",
                row.competency
            ));
        }
    }

    Ok(())
}

fn repair_instructions_for_batch() -> &'static str {
    "Return STRICT JSON only. \
     Ensure results contains exactly one entry per input competency. \
     For each competency, return exactly 3 examples with non-empty title/example. \
     Do NOT include any company/product/technology terms unless they appear verbatim \
     in Base context or cell_text. \
     Keep each example 2-4 sentences. Escape all quotes/newlines properly."
}

fn llm_failure(err: LlmError) -> anyhow::Error {
    match err {
        LlmError::Retryable(_) => anyhow::Error::new(err),
        LlmError::NonRetryable(message) => AppError::llm_non_retryable(message).into(),
    }
}

// ---------------------------------------------------------------------------
// Kickoff (fan-out)
// ---------------------------------------------------------------------------

/// Claim `MATRIX_PARSED -> GENERATING_EXAMPLES` and fan out one
/// `generate_cells` task per (level, competency range), plus a delayed
/// finalize poller.
///
/// Idempotent: when the guide is already GENERATING_EXAMPLES or DONE (a
/// duplicate kickoff delivery), nothing is enqueued.
pub async fn start_generation(
    ctx: &PipelineContext,
    guide_id: &str,
    prompt_version: &str,
) -> anyhow::Result<KickoffOutcome> {
    let (levels, comps) = {
        let mut conn = ctx.pool.acquire().await?;
        let guide = guide_repo::get(&mut *conn, guide_id)
            .await?
            .ok_or_else(|| AppError::not_found("Guide not found"))?;
        let status = GuideStatus::parse(&guide.status)?;

        if status == GuideStatus::Done || status == GuideStatus::GeneratingExamples {
            return Ok(KickoffOutcome {
                status,
                tasks_enqueued: 0,
                levels: 0,
                competencies: 0,
                chunk_size: 0,
            });
        }
        if status != GuideStatus::MatrixParsed {
            return Err(AppError::validation(format!(
                "Guide not ready for generation (current={status})"
            ))
            .into());
        }

        let claimed = guide_repo::claim_status(
            &mut *conn,
            guide_id,
            GuideStatus::MatrixParsed,
            GuideStatus::GeneratingExamples,
        )
        .await?;
        if !claimed {
            let latest = guide_repo::get(&mut *conn, guide_id)
                .await?
                .ok_or_else(|| AppError::not_found("Guide not found"))?;
            return Ok(KickoffOutcome {
                status: GuideStatus::parse(&latest.status)?,
                tasks_enqueued: 0,
                levels: 0,
                competencies: 0,
                chunk_size: 0,
            });
        }

        let levels = matrix::list_levels(&mut *conn, guide_id).await?;
        let comps = matrix::list_competencies(&mut *conn, guide_id).await?;
        (levels, comps)
    };

    if levels.is_empty() || comps.is_empty() {
        return Err(AppError::not_found("Missing levels/competencies; run parsing first").into());
    }

    let effective_chunk_size = if comps.len() > 8 {
        DEFAULT_CHUNK_SIZE
    } else {
        comps.len()
    };
    let ranges = chunk_ranges(comps.len(), effective_chunk_size);

    let mut enqueued = 0usize;
    for level in &levels {
        for (start, end) in &ranges {
            ctx.queue
                .enqueue(
                    "generate_cells",
                    &serde_json::json!({
                        "guide_id": guide_id,
                        "level_id": level.id,
                        "start": start,
                        "end": end,
                        "prompt_version": prompt_version,
                    }),
                    None,
                )
                .await?;
            enqueued += 1;
        }
    }

    ctx.queue
        .enqueue(
            "finalize_generation",
            &serde_json::json!({ "guide_id": guide_id, "prompt_version": prompt_version }),
            Some(Duration::from_secs(ctx.settings.queue.finalize_delay_seconds)),
        )
        .await?;

    info!(
        guide_id,
        tasks_enqueued = enqueued,
        levels = levels.len(),
        competencies = comps.len(),
        chunk_size = effective_chunk_size,
        "generation fan-out enqueued"
    );
    Ok(KickoffOutcome {
        status: GuideStatus::GeneratingExamples,
        tasks_enqueued: enqueued,
        levels: levels.len(),
        competencies: comps.len(),
        chunk_size: effective_chunk_size,
    })
}

// ---------------------------------------------------------------------------
// Chunk executor
// ---------------------------------------------------------------------------

/// Persist a terminal outcome row for every wanted cell in one transaction.
async fn persist_outcomes(
    ctx: &PipelineContext,
    guide_id: &str,
    wanted: &[(String, GuideCell)],
    prompt_version: &str,
    outcome_for: impl Fn(&str) -> (&'static str, Option<serde_json::Value>, Option<String>),
) -> anyhow::Result<usize> {
    let mut tx = ctx.pool.begin().await?;
    let mut written = 0usize;
    for (competency_name, cell) in wanted {
        let (status, content, error_message) = outcome_for(competency_name);
        gen_repo::upsert_cell_generation(
            &mut *tx,
            gen_repo::NewCellGeneration {
                guide_id,
                cell_id: &cell.id,
                prompt_name: PROMPT_NAME,
                prompt_version,
                status,
                content_json: content.as_ref(),
                model: Some(&ctx.settings.llm.gemini_model),
                trace_id: None,
                error_message: error_message.as_deref(),
            },
        )
        .await?;
        written += 1;
    }
    tx.commit().await?;
    Ok(written)
}

/// Generate examples for competencies `[start, end)` at one level.
///
/// Idempotent: cells whose generation row is already SUCCESS are skipped,
/// so redelivery or a late retry after DONE never overwrites good output.
pub async fn generate_level_chunk(
    ctx: &PipelineContext,
    guide_id: &str,
    level_id: &str,
    start: usize,
    end: usize,
    prompt_version: &str,
) -> anyhow::Result<ChunkOutcome> {
    let (guide, level, wanted, items) = {
        let mut conn = ctx.pool.acquire().await?;
        let guide = guide_repo::get(&mut *conn, guide_id)
            .await?
            .ok_or_else(|| AppError::not_found("Guide not found"))?;
        let status = GuideStatus::parse(&guide.status)?;
        if status != GuideStatus::GeneratingExamples && status != GuideStatus::Done {
            return Err(AppError::validation(format!(
                "Guide not in GENERATING_EXAMPLES/DONE (current={status})"
            ))
            .into());
        }

        let level = matrix::get_level(&mut *conn, guide_id, level_id)
            .await?
            .ok_or_else(|| AppError::not_found("Level not found"))?;

        let comps = matrix::list_competencies(&mut *conn, guide_id).await?;
        let chunk = comps
            .get(start.min(comps.len())..end.min(comps.len()))
            .unwrap_or(&[]);
        if chunk.is_empty() {
            return Ok(ChunkOutcome {
                written: 0,
                skipped_reason: Some("empty_chunk"),
            });
        }

        let cells = matrix::list_cells_for_level(&mut *conn, guide_id, level_id).await?;
        let cell_by_comp: BTreeMap<&str, &GuideCell> =
            cells.iter().map(|c| (c.competency_id.as_str(), c)).collect();

        let mut wanted: Vec<(String, GuideCell)> = Vec::new();
        let mut items: Vec<ChunkItem> = Vec::new();
        for comp in chunk {
            let Some(cell) = cell_by_comp.get(comp.id.as_str()) else {
                continue;
            };
            let existing = gen_repo::get_cell_generation(
                &mut *conn,
                &cell.id,
                PROMPT_NAME,
                prompt_version,
            )
            .await?;
            if existing.map(|e| e.status == "SUCCESS").unwrap_or(false) {
                continue;
            }
            items.push(ChunkItem {
                competency: comp.name.clone(),
                cell_text: cell
                    .definition_text
                    .as_deref()
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            });
            wanted.push((comp.name.clone(), (*cell).clone()));
        }

        (guide, level, wanted, items)
    };

    if items.is_empty() {
        return Ok(ChunkOutcome {
            written: 0,
            skipped_reason: Some("already_done"),
        });
    }

    let company = {
        let mut conn = ctx.pool.acquire().await?;
        company::get(&mut *conn, &guide.company_id)
            .await?
            .ok_or_else(|| AppError::not_found("Company not found"))?
    };

    let context_text = base_context(&company, &guide);
    let role = guide
        .role_title
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or("Unknown")
        .to_string();
    let level_label = level.code.trim().to_string();

    let mut variables = BTreeMap::new();
    variables.insert("base_context".to_string(), context_text.clone());
    variables.insert("role".to_string(), role);
    variables.insert("level".to_string(), level_label);
    variables.insert("items_json".to_string(), serde_json::to_string(&items)?);

    let first = ctx
        .llm
        .generate_structured::<GenerateExamplesBatchResult>(
            PROMPT_NAME,
            PROMPT_NAME,
            prompt_version,
            &variables,
        )
        .await
        .map_err(llm_failure)?;

    let result = match validate_batch(&first, &items, &context_text) {
        Ok(()) => first,
        Err(first_failure) => {
            warn!(guide_id, level_id, error = %first_failure, "batch failed validation, repairing");
            let mut repair_vars = variables.clone();
            repair_vars.insert(
                crate::llm::prompts::REPAIR_INSTRUCTIONS_KEY.to_string(),
                repair_instructions_for_batch().to_string(),
            );

            let second = ctx
                .llm
                .generate_structured::<GenerateExamplesBatchResult>(
                    PROMPT_NAME,
                    PROMPT_NAME,
                    prompt_version,
                    &repair_vars,
                )
                .await
                .map_err(llm_failure)?;

            match validate_batch(&second, &items, &context_text) {
                Ok(()) => second,
                Err(second_failure) => {
                    // Both attempts failed semantic validation: persist one
                    // FAILED row per wanted cell, then surface a terminal error.
                    let message = format!("LLM validation failed: {second_failure}");
                    persist_outcomes(ctx, guide_id, &wanted, prompt_version, |_| {
                        ("FAILED", None, Some(message.clone()))
                    })
                    .await?;

                    return Err(AppError::internal(format!(
                        "LLM output validation failed: {second_failure}"
                    ))
                    .into());
                }
            }
        }
    };

    let out_map: BTreeMap<&str, &crate::schemas::CompetencyExamples> = result
        .results
        .iter()
        .map(|r| (r.competency.as_str(), r))
        .collect();

    let written = persist_outcomes(ctx, guide_id, &wanted, prompt_version, |competency| {
        match out_map.get(competency) {
            Some(row) => (
                "SUCCESS",
                Some(serde_json::json!({ "examples": row.examples })),
                None,
            ),
            None => (
                "FAILED",
                None,
                Some("Missing competency in LLM output".to_string()),
            ),
        }
    })
    .await?;

    info!(guide_id, level_id, start, end, written, "chunk generated");
    Ok(ChunkOutcome {
        written,
        skipped_reason: None,
    })
}

// ---------------------------------------------------------------------------
// Finalize
// ---------------------------------------------------------------------------

/// Decide whether generation is complete by counting persisted rows.
///
/// Non-terminal when outcome rows are still missing; `FAILED_GENERATION`
/// when every cell has an outcome and at least one FAILED; `DONE`
/// otherwise. Idempotent once the guide is terminal.
pub async fn finalize(
    ctx: &PipelineContext,
    guide_id: &str,
    prompt_version: &str,
) -> anyhow::Result<FinalizeOutcome> {
    let mut conn = ctx.pool.acquire().await?;
    let guide = guide_repo::get(&mut *conn, guide_id)
        .await?
        .ok_or_else(|| AppError::not_found("Guide not found"))?;
    let status = GuideStatus::parse(&guide.status)?;

    let total_cells = matrix::count_cells(&mut *conn, guide_id).await?;
    let total_rows =
        gen_repo::count_total_for_guide(&mut *conn, guide_id, PROMPT_NAME, prompt_version).await?;
    let success =
        gen_repo::count_success_for_guide(&mut *conn, guide_id, PROMPT_NAME, prompt_version).await?;
    let failed = (total_rows - success).max(0);

    if status.is_terminal() {
        return Ok(FinalizeOutcome {
            status,
            success,
            failed,
            total_cells,
            total_rows,
        });
    }

    if total_cells > 0 && total_rows >= total_cells {
        let final_status = if failed > 0 {
            GuideStatus::FailedGeneration
        } else {
            GuideStatus::Done
        };
        let claimed = guide_repo::claim_status(
            &mut *conn,
            guide_id,
            GuideStatus::GeneratingExamples,
            final_status,
        )
        .await?;
        let status = if claimed {
            info!(guide_id, status = %final_status, success, failed, "generation finalized");
            final_status
        } else {
            // Another finalize delivery won the transition.
            let latest = guide_repo::get(&mut *conn, guide_id)
                .await?
                .ok_or_else(|| AppError::not_found("Guide not found"))?;
            GuideStatus::parse(&latest.status)?
        };
        return Ok(FinalizeOutcome {
            status,
            success,
            failed,
            total_cells,
            total_rows,
        });
    }

    Ok(FinalizeOutcome {
        status,
        success,
        failed,
        total_cells,
        total_rows,
    })
}

// ---------------------------------------------------------------------------
// Results view
// ---------------------------------------------------------------------------

/// Render the populated matrix with per-cell generation status and
/// progress counters.
pub async fn get_results(
    ctx: &PipelineContext,
    guide_id: &str,
    prompt_version: &str,
) -> anyhow::Result<GuideResults> {
    let mut conn = ctx.pool.acquire().await?;
    let guide = guide_repo::get(&mut *conn, guide_id)
        .await?
        .ok_or_else(|| AppError::not_found("Guide not found"))?;

    let levels = matrix::list_levels(&mut *conn, guide_id).await?;
    let comps = matrix::list_competencies(&mut *conn, guide_id).await?;
    let cells = matrix::list_cells(&mut *conn, guide_id).await?;
    let generations =
        gen_repo::list_for_guide(&mut *conn, guide_id, PROMPT_NAME, prompt_version).await?;
    let success =
        gen_repo::count_success_for_guide(&mut *conn, guide_id, PROMPT_NAME, prompt_version).await?;

    let gen_by_cell: BTreeMap<&str, &crate::db::models::CellGeneration> =
        generations.iter().map(|g| (g.cell_id.as_str(), g)).collect();
    let cell_map: BTreeMap<(&str, &str), &GuideCell> = cells
        .iter()
        .map(|c| ((c.competency_id.as_str(), c.level_id.as_str()), c))
        .collect();

    let out_levels: Vec<LevelOut> = levels
        .iter()
        .map(|l| LevelOut {
            id: l.id.clone(),
            label: l.code.clone(),
            position: l.position,
        })
        .collect();

    let mut out_comps: Vec<CompetencyOut> = Vec::with_capacity(comps.len());
    for comp in &comps {
        let mut row = CompetencyOut {
            id: comp.id.clone(),
            name: comp.name.clone(),
            position: comp.position,
            cells: Vec::with_capacity(levels.len()),
        };
        for level in &levels {
            let Some(cell) = cell_map.get(&(comp.id.as_str(), level.id.as_str())) else {
                row.cells.push(CellOut {
                    level_id: level.id.clone(),
                    cell_id: None,
                    definition_text: None,
                    examples: Vec::new(),
                    generation_status: "MISSING_CELL".to_string(),
                });
                continue;
            };

            let generation = gen_by_cell.get(cell.id.as_str());
            let status = generation
                .map(|g| g.status.clone())
                .unwrap_or_else(|| "PENDING".to_string());
            let examples: Vec<GeneratedExample> = generation
                .and_then(|g| g.content_json.as_deref())
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                .and_then(|v| {
                    v.get("examples")
                        .cloned()
                        .and_then(|e| serde_json::from_value(e).ok())
                })
                .unwrap_or_default();

            row.cells.push(CellOut {
                level_id: level.id.clone(),
                cell_id: Some(cell.id.clone()),
                definition_text: cell.definition_text.clone(),
                examples,
                generation_status: status,
            });
        }
        out_comps.push(row);
    }

    let expected = i64::try_from(levels.len() * comps.len()).unwrap_or(i64::MAX);
    Ok(GuideResults {
        guide_id: guide.id,
        status: guide.status,
        prompt_version: prompt_version.to_string(),
        progress: Progress {
            expected,
            completed: success,
        },
        levels: out_levels,
        competencies: out_comps,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
