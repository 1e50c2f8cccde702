//! Task types and pipeline wiring.
//!
//! Five named tasks drive a guide through the pipeline:
//!
//! - `extract_text` — on success where status is TEXT_EXTRACTED, enqueues
//!   `parse_matrix`
//! - `parse_matrix` — on success where status is MATRIX_PARSED, enqueues
//!   `kickoff_generation`
//! - `kickoff_generation` — claims the generate phase, fans out
//!   `generate_cells` over levels × competency ranges, and enqueues a
//!   delayed `finalize_generation`
//! - `generate_cells` — runs one chunk; enqueues nothing
//! - `finalize_generation` — polls; re-raises a retryable error while the
//!   guide is non-terminal so the runner reschedules it
//!
//! Retry budgets: extract/parse 5 × 15s, kickoff 3 × 20s, generate 3 × 15s,
//! finalize 240 × 30s (≈ 2h cap).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::queue::{RetryPolicy, TaskHandler, TaskRegistry};
use crate::service::{generation, guide, PipelineContext};
use crate::status::GuideStatus;

/// Route a task name to its named queue, one queue per phase.
pub fn route_task(name: &str) -> &'static str {
    match name {
        "extract_text" => "extract",
        "parse_matrix" => "parse",
        "kickoff_generation" | "generate_cells" | "finalize_generation" => "generate",
        _ => "default",
    }
}

/// Build the registry with every pipeline task bound to `ctx`.
pub fn build_registry(ctx: PipelineContext) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(ExtractTextTask { ctx: ctx.clone() }));
    registry.register(Arc::new(ParseMatrixTask { ctx: ctx.clone() }));
    registry.register(Arc::new(KickoffGenerationTask { ctx: ctx.clone() }));
    registry.register(Arc::new(GenerateCellsTask { ctx: ctx.clone() }));
    registry.register(Arc::new(FinalizeGenerationTask { ctx }));
    registry
}

fn default_prompt_version() -> String {
    "v1".to_string()
}

#[derive(Debug, Deserialize)]
struct GuideArgs {
    guide_id: String,
}

#[derive(Debug, Deserialize)]
struct PromptedArgs {
    guide_id: String,
    #[serde(default = "default_prompt_version")]
    prompt_version: String,
}

#[derive(Debug, Deserialize)]
struct ChunkArgs {
    guide_id: String,
    level_id: String,
    start: usize,
    end: usize,
    #[serde(default = "default_prompt_version")]
    prompt_version: String,
}

// ---------------------------------------------------------------------------
// extract_text
// ---------------------------------------------------------------------------

struct ExtractTextTask {
    ctx: PipelineContext,
}

#[async_trait]
impl TaskHandler for ExtractTextTask {
    fn name(&self) -> &'static str {
        "extract_text"
    }

    fn queue(&self) -> &'static str {
        "extract"
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(5, 15)
    }

    async fn run(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let args: GuideArgs = serde_json::from_value(args)?;

        let outcome = guide::extract_pdf_text(&self.ctx, &args.guide_id).await?;
        let status = match &outcome {
            guide::ExtractOutcome::Completed { status, .. }
            | guide::ExtractOutcome::Skipped { status } => *status,
        };

        let chained = if status == GuideStatus::TextExtracted {
            self.ctx
                .queue
                .enqueue("parse_matrix", &json!({ "guide_id": args.guide_id }), None)
                .await?;
            info!(guide_id = %args.guide_id, from = "extract_text", to = "parse_matrix", "task chain");
            Some("parse_matrix")
        } else {
            None
        };

        Ok(json!({
            "ok": true,
            "guide_id": args.guide_id,
            "status": status,
            "chained": chained,
        }))
    }
}

// ---------------------------------------------------------------------------
// parse_matrix
// ---------------------------------------------------------------------------

struct ParseMatrixTask {
    ctx: PipelineContext,
}

#[async_trait]
impl TaskHandler for ParseMatrixTask {
    fn name(&self) -> &'static str {
        "parse_matrix"
    }

    fn queue(&self) -> &'static str {
        "parse"
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(5, 15)
    }

    async fn run(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let args: GuideArgs = serde_json::from_value(args)?;

        guide::parse_matrix(&self.ctx, &args.guide_id).await?;

        let status = guide::get_status(&self.ctx, &args.guide_id).await?.status;
        let chained = if status == GuideStatus::MatrixParsed.as_str() {
            self.ctx
                .queue
                .enqueue(
                    "kickoff_generation",
                    &json!({ "guide_id": args.guide_id }),
                    None,
                )
                .await?;
            info!(guide_id = %args.guide_id, from = "parse_matrix", to = "kickoff_generation", "task chain");
            Some("kickoff_generation")
        } else {
            None
        };

        Ok(json!({
            "ok": true,
            "guide_id": args.guide_id,
            "status": status,
            "chained": chained,
        }))
    }
}

// ---------------------------------------------------------------------------
// kickoff_generation
// ---------------------------------------------------------------------------

struct KickoffGenerationTask {
    ctx: PipelineContext,
}

#[async_trait]
impl TaskHandler for KickoffGenerationTask {
    fn name(&self) -> &'static str {
        "kickoff_generation"
    }

    fn queue(&self) -> &'static str {
        "generate"
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(3, 20)
    }

    async fn run(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let args: PromptedArgs = serde_json::from_value(args)?;
        let outcome =
            generation::start_generation(&self.ctx, &args.guide_id, &args.prompt_version).await?;
        Ok(serde_json::to_value(&outcome)?)
    }
}

// ---------------------------------------------------------------------------
// generate_cells
// ---------------------------------------------------------------------------

struct GenerateCellsTask {
    ctx: PipelineContext,
}

#[async_trait]
impl TaskHandler for GenerateCellsTask {
    fn name(&self) -> &'static str {
        "generate_cells"
    }

    fn queue(&self) -> &'static str {
        "generate"
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(3, 15)
    }

    async fn run(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let args: ChunkArgs = serde_json::from_value(args)?;
        let outcome = generation::generate_level_chunk(
            &self.ctx,
            &args.guide_id,
            &args.level_id,
            args.start,
            args.end,
            &args.prompt_version,
        )
        .await?;
        Ok(serde_json::to_value(&outcome)?)
    }
}

// ---------------------------------------------------------------------------
// finalize_generation
// ---------------------------------------------------------------------------

struct FinalizeGenerationTask {
    ctx: PipelineContext,
}

#[async_trait]
impl TaskHandler for FinalizeGenerationTask {
    fn name(&self) -> &'static str {
        "finalize_generation"
    }

    fn queue(&self) -> &'static str {
        "generate"
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(240, 30)
    }

    async fn run(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let args: PromptedArgs = serde_json::from_value(args)?;
        let outcome = generation::finalize(&self.ctx, &args.guide_id, &args.prompt_version).await?;

        if !outcome.status.is_terminal() {
            // Retryable by construction: the runner reschedules the poll.
            anyhow::bail!("generation not finished yet (status={})", outcome.status);
        }

        Ok(serde_json::to_value(&outcome)?)
    }
}
