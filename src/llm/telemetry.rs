//! Structured telemetry for gateway invocations.
//!
//! One record per `generate_structured`/`generate_text` invocation at its
//! terminal outcome, success or failure. Repair round-trips stay inside the
//! same invocation and do not produce a second record.

/// Terminal outcome of one gateway invocation.
#[derive(Debug)]
pub struct LlmCallRecord<'a> {
    pub trace_id: &'a str,
    pub provider: &'a str,
    pub model: &'a str,
    pub purpose: &'a str,
    pub prompt_name: &'a str,
    pub prompt_version: &'a str,
    pub latency_ms: u64,
    pub retries: u32,
    pub ok: bool,
    pub error_type: Option<&'a str>,
}

/// Emit the record as a structured tracing event on the `llm` target.
pub fn record_llm_call(record: &LlmCallRecord<'_>) {
    tracing::info!(
        target: "llm",
        trace_id = record.trace_id,
        provider = record.provider,
        model = record.model,
        purpose = record.purpose,
        prompt = %format_args!("{}@{}", record.prompt_name, record.prompt_version),
        latency_ms = record.latency_ms,
        retries = record.retries,
        ok = record.ok,
        error_type = record.error_type,
        "llm_call"
    );
}
