//! Configuration loading and management.
//!
//! Loads settings from `./levelforge.toml` (or `$LEVELFORGE_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

// ── Top-level settings ──────────────────────────────────────────

/// Top-level configuration record, passed by value into executors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// SQLite connection string (also backs the task queue).
    pub database_url: DatabaseUrl,
    /// Object storage binding.
    pub storage: StorageSettings,
    /// LLM provider binding and runtime knobs.
    pub llm: LlmSettings,
    /// Task queue worker knobs.
    pub queue: QueueSettings,
    /// Single-admin auth material, held for the external ingress layer.
    pub auth: AuthSettings,
    /// Directory for rotated JSON log files in `serve` mode.
    pub logs_dir: LogsDir,
}

/// Newtype so the database URL can default sensibly under `#[serde(default)]`.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseUrl(pub String);

impl Default for DatabaseUrl {
    fn default() -> Self {
        Self("sqlite://levelforge.db?mode=rwc".to_string())
    }
}

/// Newtype for the log directory default.
#[derive(Debug, Clone, Deserialize)]
pub struct LogsDir(pub String);

impl Default for LogsDir {
    fn default() -> Self {
        Self("logs".to_string())
    }
}

impl Settings {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$LEVELFORGE_CONFIG_PATH` or `./levelforge.toml`.
    /// If the file does not exist, defaults are used.
    pub fn load() -> Result<Self> {
        let mut settings = Self::load_from_file()?;
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let settings: Settings =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Settings::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("LEVELFORGE_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("levelforge.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests can inject variables without
    /// mutating the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("DATABASE_URL") {
            self.database_url = DatabaseUrl(v);
        }
        if let Some(v) = env("LEVELFORGE_LOGS_DIR") {
            self.logs_dir = LogsDir(v);
        }

        // Storage.
        if let Some(v) = env("SUPABASE_URL") {
            self.storage.url = v;
        }
        if let Some(v) = env("SUPABASE_SERVICE_ROLE_KEY") {
            self.storage.service_role_key = v;
        }
        if let Some(v) = env("SUPABASE_STORAGE_BUCKET") {
            self.storage.bucket = v;
        }

        // LLM.
        if let Some(v) = env("LLM_PROVIDER") {
            self.llm.provider = v;
        }
        if let Some(v) = env("GEMINI_API_KEY") {
            self.llm.gemini_api_key = v;
        }
        if let Some(v) = env("GEMINI_MODEL") {
            self.llm.gemini_model = v;
        }
        override_parsed(&env, "LLM_TIMEOUT_SECONDS", &mut self.llm.timeout_seconds);
        override_parsed(&env, "LLM_MAX_RETRIES", &mut self.llm.max_retries);
        override_parsed(&env, "LLM_MAX_OUTPUT_TOKENS", &mut self.llm.max_output_tokens);
        override_parsed(&env, "LLM_TEMPERATURE", &mut self.llm.temperature);

        // Queue.
        override_parsed(&env, "WORKER_CONCURRENCY", &mut self.queue.worker_concurrency);
        override_parsed(&env, "QUEUE_POLL_INTERVAL_MS", &mut self.queue.poll_interval_ms);
        override_parsed(&env, "QUEUE_LEASE_SECONDS", &mut self.queue.lease_seconds);
        override_parsed(
            &env,
            "QUEUE_FINALIZE_DELAY_SECONDS",
            &mut self.queue.finalize_delay_seconds,
        );

        // Auth (ingress concern; carried, not enforced here).
        if let Some(v) = env("JWT_SECRET_KEY") {
            self.auth.jwt_secret_key = Some(v);
        }
        if let Some(v) = env("JWT_ALGORITHM") {
            self.auth.jwt_algorithm = v;
        }
        if let Some(v) = env("ADMIN_USERNAME") {
            self.auth.admin_username = Some(v);
        }
        if let Some(v) = env("ADMIN_PASSWORD") {
            self.auth.admin_password = Some(v);
        }
    }

    /// Parse a TOML string into settings (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(settings)
    }
}

fn override_parsed<T: std::str::FromStr>(
    env: impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}

// ── Storage settings ────────────────────────────────────────────

/// Supabase storage binding.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Supabase project base URL.
    pub url: String,
    /// Service-role key used for private bucket access.
    pub service_role_key: String,
    /// Bucket holding guide PDFs and extracted text.
    pub bucket: String,
}

impl std::fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSettings")
            .field("url", &self.url)
            .field("service_role_key", &"__REDACTED__")
            .field("bucket", &self.bucket)
            .finish()
    }
}

// ── LLM settings ────────────────────────────────────────────────

/// LLM provider selection and runtime knobs.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Logical provider name; one provider is active at a time.
    pub provider: String,
    /// Gemini API key.
    pub gemini_api_key: String,
    /// Gemini model identifier.
    pub gemini_model: String,
    /// Per-call HTTP timeout in seconds.
    pub timeout_seconds: u64,
    /// Retries after the first attempt (2 retries = 3 attempts total).
    pub max_retries: u32,
    /// Output token ceiling; raised to 8192 for matrix parsing.
    pub max_output_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            gemini_api_key: String::new(),
            gemini_model: "gemini-2.0-flash".to_string(),
            timeout_seconds: 30,
            max_retries: 2,
            max_output_tokens: 800,
            temperature: 0.4,
        }
    }
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("provider", &self.provider)
            .field("gemini_api_key", &"__REDACTED__")
            .field("gemini_model", &self.gemini_model)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("max_retries", &self.max_retries)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

// ── Queue settings ──────────────────────────────────────────────

/// Task queue worker knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Concurrent workers per named queue (each claims one task at a time).
    pub worker_concurrency: usize,
    /// Idle poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Lease after which a RUNNING task is considered lost and redelivered.
    pub lease_seconds: u64,
    /// Delay before the first finalize poll after generation kickoff.
    pub finalize_delay_seconds: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            poll_interval_ms: 500,
            lease_seconds: 300,
            finalize_delay_seconds: 30,
        }
    }
}

// ── Auth settings ───────────────────────────────────────────────

/// Single-admin auth material for the external HTTP ingress.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HMAC secret for session tokens.
    pub jwt_secret_key: Option<String>,
    /// Signing algorithm name.
    pub jwt_algorithm: String,
    /// Admin login.
    pub admin_username: Option<String>,
    /// Admin password.
    pub admin_password: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret_key: None,
            jwt_algorithm: "HS256".to_string(),
            admin_username: None,
            admin_password: None,
        }
    }
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("jwt_secret_key", &self.jwt_secret_key.as_ref().map(|_| "__REDACTED__"))
            .field("jwt_algorithm", &self.jwt_algorithm)
            .field("admin_username", &self.admin_username)
            .field("admin_password", &self.admin_password.as_ref().map(|_| "__REDACTED__"))
            .finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────
