//! Configuration for the evaluation harness.
//!
//! Supports both environment variables and a YAML config file.
//! Environment variables take precedence over config file values.
//! Settings are resolved once at startup and handed to the clients as
//! immutable values; nothing below reads the environment at call time.

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Marker used in sample `.env` files for keys that were never filled in.
const KEY_PLACEHOLDER: &str = "<your-";

/// How a client authenticates against its service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Sent as the `api-key` header (or bearer token for OpenAI-compatible judges).
    ApiKey(String),
    /// A pre-acquired Entra ID / OAuth access token, sent as `Authorization: Bearer`.
    BearerToken(String),
}

/// Search index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Service endpoint (e.g., "https://my-search.search.windows.net")
    pub endpoint: String,

    /// Name of the index to query
    pub index: String,

    pub api_key: Option<String>,

    pub bearer_token: Option<String>,

    pub api_version: String,

    /// Document fields tried, in order, for the passage text
    pub content_fields: Vec<String>,

    pub request_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            index: String::new(),
            api_key: None,
            bearer_token: None,
            api_version: "2023-11-01".to_string(),
            content_fields: vec!["content".into(), "text".into(), "chunk".into()],
            request_timeout_secs: 30,
        }
    }
}

impl SearchConfig {
    pub fn credential(&self) -> Result<Credential> {
        resolve_credential(
            self.api_key.as_deref(),
            self.bearer_token.as_deref(),
            "Search credential is required. Set AZURE_SEARCH_KEY or AZURE_SEARCH_TOKEN, or add search.api_key to the config file.",
        )
    }
}

/// Which chat-completion API the judge deployment speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JudgeProvider {
    /// Azure OpenAI deployment (`/openai/deployments/{name}/chat/completions`).
    #[default]
    Azure,
    /// Any OpenAI-compatible endpoint (`/v1/chat/completions`).
    #[serde(rename = "openai")]
    OpenAi,
}

impl std::str::FromStr for JudgeProvider {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "azure" => Ok(JudgeProvider::Azure),
            "openai" => Ok(JudgeProvider::OpenAi),
            other => Err(EvalError::config(format!(
                "Unknown judge provider '{}'. Expected 'azure' or 'openai'.",
                other
            ))),
        }
    }
}

/// Judge (LLM) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub provider: JudgeProvider,

    /// Base URL of the judge service
    pub endpoint: String,

    /// Azure deployment name, or model name for OpenAI-compatible endpoints
    pub deployment: String,

    pub api_key: Option<String>,

    pub bearer_token: Option<String>,

    /// Only used by the Azure provider
    pub api_version: String,

    pub max_tokens: u32,

    pub temperature: f32,

    pub request_timeout_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            provider: JudgeProvider::default(),
            endpoint: String::new(),
            deployment: String::new(),
            api_key: None,
            bearer_token: None,
            api_version: "2024-02-15-preview".to_string(),
            max_tokens: 512,
            temperature: 0.0,
            request_timeout_secs: 60,
        }
    }
}

impl JudgeConfig {
    pub fn credential(&self) -> Result<Credential> {
        resolve_credential(
            self.api_key.as_deref(),
            self.bearer_token.as_deref(),
            "Judge credential is required. Set AZURE_OPENAI_API_KEY or AZURE_OPENAI_AD_TOKEN, or add judge.api_key to the config file.",
        )
    }
}

/// What the runner does with a query whose retrieval failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalFailurePolicy {
    /// Keep a failed record tagged with the retrieval error.
    #[default]
    Record,
    /// Leave the query out of the records; it is still logged and counted.
    Skip,
}

/// Settings of the evaluation run itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Documents retrieved per query.
    pub top_k: usize,
    /// Queries evaluated at once; also caps in-flight judge calls.
    pub concurrency: usize,
    /// Wall-clock budget for the whole run.
    pub run_timeout_secs: Option<u64>,
    pub on_retrieval_error: RetrievalFailurePolicy,
    /// Send queries with zero retrieved documents to the judge anyway.
    pub judge_empty_context: bool,
    /// Placed between documents in the assembled context.
    pub separator: String,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            concurrency: 4,
            run_timeout_secs: None,
            on_retrieval_error: RetrievalFailurePolicy::default(),
            judge_empty_context: false,
            separator: "\n\n".to_string(),
        }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(EvalError::config("evaluation.top_k must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(EvalError::config("evaluation.concurrency must be at least 1"));
        }
        if self.run_timeout_secs == Some(0) {
            return Err(EvalError::config(
                "evaluation.run_timeout_secs must be positive when set",
            ));
        }
        Ok(())
    }
}

/// Backoff configuration for judge calls.
///
/// Each transient failure waits an increasing period before the next attempt,
/// until `max_attempts` calls were made or `max_elapsed_secs` ran out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total calls per query, including the first one.
    pub max_attempts: u32,
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    /// Introduces randomness to avoid retry storms
    pub randomization_factor: f64,
    pub max_elapsed_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 1000,
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_elapsed_secs: 120,
        }
    }
}

/// Patterns stripped from retrieved text before it reaches the judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    /// Extensions (without the dot) that mark a path token as an image.
    pub image_extensions: Vec<String>,
    /// `![alt](path)` and `![alt][ref]`
    pub strip_markdown_images: bool,
    /// `<img ...>`
    pub strip_html_images: bool,
    /// Whole tokens such as `./figs/a.png` or `cs-1.png`
    pub strip_bare_paths: bool,
    /// Additional regular expressions removed verbatim.
    pub extra_patterns: Vec<String>,
    pub max_input_bytes: Option<usize>,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            image_extensions: ["png", "jpg", "jpeg", "gif", "bmp", "svg", "webp", "tif", "tiff", "ico"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            strip_markdown_images: true,
            strip_html_images: true,
            strip_bare_paths: true,
            extra_patterns: Vec::new(),
            max_input_bytes: None,
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub search: SearchConfig,
    pub judge: JudgeConfig,
    pub evaluation: EvaluationConfig,
    pub retry: RetryConfig,
    pub sanitizer: SanitizerConfig,
    /// Test queries; the built-in sample set is used when empty.
    pub queries: Vec<String>,
}

impl Config {
    /// Load configuration from an optional config file and the environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (AZURE_SEARCH_*, AZURE_OPENAI_*, JUDGE_PROVIDER)
    /// 2. Config file (`path`, else ~/.config/retrieval-eval/config.yaml)
    /// 3. Default values
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::config_file_path() {
                Some(default_path) if default_path.exists() => {
                    Self::load_from_file(&default_path)?
                }
                _ => Config::default(),
            },
        };

        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;

        serde_yaml::from_str(&content)
            .map_err(|e| EvalError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Override settings from environment-style lookups.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(endpoint) = get("AZURE_SEARCH_ENDPOINT") {
            self.search.endpoint = endpoint;
        }
        if let Some(index) = get("AZURE_SEARCH_INDEX") {
            self.search.index = index;
        }
        if let Some(key) = get("AZURE_SEARCH_KEY") {
            self.search.api_key = Some(key);
        }
        if let Some(token) = get("AZURE_SEARCH_TOKEN") {
            self.search.bearer_token = Some(token);
        }

        if let Some(provider) = get("JUDGE_PROVIDER") {
            self.judge.provider = provider.parse()?;
        }
        if let Some(endpoint) = get("AZURE_OPENAI_ENDPOINT") {
            self.judge.endpoint = endpoint;
        }
        if let Some(deployment) = get("AZURE_OPENAI_DEPLOYMENT") {
            self.judge.deployment = deployment;
        }
        if let Some(key) = get("AZURE_OPENAI_API_KEY") {
            self.judge.api_key = Some(key);
        }
        if let Some(token) = get("AZURE_OPENAI_AD_TOKEN") {
            self.judge.bearer_token = Some(token);
        }
        if let Some(version) = get("AZURE_OPENAI_API_VERSION") {
            self.judge.api_version = version;
        }

        Ok(())
    }

    /// Get the default config file path.
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "retrieval-eval")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<()> {
        require_url(&self.search.endpoint, "Search endpoint", "AZURE_SEARCH_ENDPOINT")?;

        if self.search.index.trim().is_empty() {
            return Err(EvalError::config(
                "Search index name is required. Set AZURE_SEARCH_INDEX environment variable or add to config file.",
            ));
        }

        if self.search.content_fields.is_empty() {
            return Err(EvalError::config(
                "search.content_fields must name at least one field",
            ));
        }

        self.search.credential()?;

        require_url(&self.judge.endpoint, "Judge endpoint", "AZURE_OPENAI_ENDPOINT")?;

        if self.judge.deployment.trim().is_empty() {
            return Err(EvalError::config(
                "Judge deployment is required. Set AZURE_OPENAI_DEPLOYMENT environment variable or add to config file.",
            ));
        }

        if self.judge.provider == JudgeProvider::Azure && self.judge.api_version.trim().is_empty() {
            return Err(EvalError::config(
                "Judge API version is required for Azure deployments.",
            ));
        }

        self.judge.credential()?;
        self.evaluation.validate()?;

        if self.retry.max_attempts == 0 {
            return Err(EvalError::config("retry.max_attempts must be at least 1"));
        }

        Ok(())
    }
}

fn require_url(value: &str, what: &str, env_key: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EvalError::config(format!(
            "{} is required. Set {} environment variable or add to config file.",
            what, env_key
        )));
    }
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(EvalError::config(format!(
            "{} '{}' must be an http(s) URL",
            what, value
        )));
    }
    Ok(())
}

fn usable(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.contains(KEY_PLACEHOLDER))
}

fn resolve_credential(
    api_key: Option<&str>,
    bearer_token: Option<&str>,
    missing: &str,
) -> Result<Credential> {
    if let Some(key) = usable(api_key) {
        return Ok(Credential::ApiKey(key.to_string()));
    }
    if let Some(token) = usable(bearer_token) {
        return Ok(Credential::BearerToken(token.to_string()));
    }
    Err(EvalError::config(missing))
}
