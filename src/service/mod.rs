//! Services: the phase executors and their shared context.
//!
//! Every executor follows the same contract: claim the status transition
//! first, read inputs, compute (no database transaction held across
//! network I/O), persist atomically, transition status, commit.

pub mod generation;
pub mod guide;

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Settings;
use crate::llm::LlmGateway;
use crate::pdf::PdfExtractor;
use crate::queue::TaskQueue;
use crate::storage::StorageClient;

/// The unit-of-work bundle passed by reference into every executor.
#[derive(Clone)]
pub struct PipelineContext {
    /// Connection pool; executors scope their own transactions.
    pub pool: SqlitePool,
    /// Object store for PDFs and extracted text.
    pub storage: Arc<dyn StorageClient>,
    /// The LLM gateway.
    pub llm: LlmGateway,
    /// PDF-to-text engine chain.
    pub extractor: Arc<dyn PdfExtractor>,
    /// Producer handle for chaining and fan-out.
    pub queue: TaskQueue,
    /// Loaded configuration.
    pub settings: Arc<Settings>,
}
