#![allow(missing_docs)]

//! Levelforge CLI.
//!
//! `serve` runs the durable task-queue workers; the one-shot subcommands
//! exercise the ingress contracts (create, status, results, signed PDF URL)
//! against the same database the workers use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use levelforge::config::Settings;
use levelforge::llm::LlmGateway;
use levelforge::pdf::DefaultPdfExtractor;
use levelforge::queue::{self, TaskQueue};
use levelforge::service::{generation, guide, PipelineContext};
use levelforge::storage::SupabaseStorage;
use levelforge::{db, logging, tasks};

#[derive(Parser)]
#[command(name = "levelforge", version, about = "Leveling-guide pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline workers until interrupted.
    Serve,
    /// Create a guide from a local PDF and enqueue extraction.
    Ingest {
        /// Path to the leveling-guide PDF.
        #[arg(long)]
        pdf: PathBuf,
        /// Company website URL.
        #[arg(long)]
        website_url: String,
        /// Role the guide describes.
        #[arg(long)]
        role_title: String,
        /// Optional company display name.
        #[arg(long)]
        company_name: Option<String>,
        /// Optional free-form company context.
        #[arg(long)]
        company_context: Option<String>,
    },
    /// Print a guide's status as JSON.
    Status {
        /// Guide id.
        guide_id: String,
    },
    /// Print the rendered matrix with generation progress as JSON.
    Results {
        /// Guide id.
        guide_id: String,
        /// Prompt version to render.
        #[arg(long, default_value = "v1")]
        prompt_version: String,
    },
    /// Print a signed download URL for the original PDF.
    PdfUrl {
        /// Guide id.
        guide_id: String,
    },
    /// Round-trip a smoke-test prompt through the configured provider.
    LlmHealth,
}

async fn build_context(settings: Settings) -> anyhow::Result<PipelineContext> {
    let pool = db::connect(&settings.database_url.0)
        .await
        .context("failed to open database")?;
    let llm = LlmGateway::from_settings(&settings.llm).map_err(anyhow::Error::new)?;
    let storage = Arc::new(SupabaseStorage::new(&settings.storage));
    let queue = TaskQueue::new(pool.clone(), tasks::route_task);

    Ok(PipelineContext {
        pool,
        storage,
        llm,
        extractor: Arc::new(DefaultPdfExtractor),
        queue,
        settings: Arc::new(settings),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    match cli.command {
        Command::Serve => {
            let _guard = logging::init_serve(Path::new(&settings.logs_dir.0))?;
            let queue_settings = settings.queue.clone();
            let ctx = build_context(settings).await?;
            let registry = Arc::new(tasks::build_registry(ctx.clone()));

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let workers = tokio::spawn(queue::run_workers(
                ctx.queue.clone(),
                registry,
                queue_settings.worker_concurrency,
                Duration::from_millis(queue_settings.poll_interval_ms),
                Duration::from_secs(queue_settings.lease_seconds),
                shutdown_rx,
            ));

            info!("levelforge workers started");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
            workers.await.context("worker pool panicked")?;
        }

        Command::Ingest {
            pdf,
            website_url,
            role_title,
            company_name,
            company_context,
        } => {
            logging::init_cli();
            let ctx = build_context(settings).await?;

            let bytes = std::fs::read(&pdf)
                .with_context(|| format!("failed to read {}", pdf.display()))?;
            let filename = pdf
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("guide.pdf")
                .to_string();

            let response = guide::create_guide_from_upload(
                &ctx,
                guide::GuideUpload {
                    website_url,
                    role_title,
                    filename,
                    content_type: "application/pdf".to_string(),
                    bytes,
                    company_name,
                    company_context,
                },
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Command::Status { guide_id } => {
            logging::init_cli();
            let ctx = build_context(settings).await?;
            let response = guide::get_status(&ctx, &guide_id).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Command::Results {
            guide_id,
            prompt_version,
        } => {
            logging::init_cli();
            let ctx = build_context(settings).await?;
            let response = generation::get_results(&ctx, &guide_id, &prompt_version).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Command::PdfUrl { guide_id } => {
            logging::init_cli();
            let ctx = build_context(settings).await?;
            let url = guide::get_signed_pdf_url(&ctx, &guide_id).await?;
            println!("{url}");
        }

        Command::LlmHealth => {
            logging::init_cli();
            let gateway = LlmGateway::from_settings(&settings.llm).map_err(anyhow::Error::new)?;
            let response = gateway
                .generate_text("smoke_test", "smoke_test", "v1", &BTreeMap::new())
                .await
                .map_err(anyhow::Error::new)?;
            println!(
                "{}",
                serde_json::json!({
                    "ok": response.output_text.contains("true"),
                    "model": response.model,
                    "latency_ms": response.latency_ms,
                    "output": response.output_text,
                })
            );
        }
    }

    Ok(())
}
