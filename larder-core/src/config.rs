//! Configuration loaded from a YAML file with enumerated environment
//! overrides applied on top.
//!
//! Every field has a default, so a missing file or a partial file is fine;
//! `validate` then rejects combinations the pipeline cannot run with, at
//! startup rather than mid-request.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("malformed config file {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Where the corpus and the index snapshot live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_documents_file")]
    pub documents_file: String,
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

impl DataConfig {
    pub fn documents_path(&self) -> PathBuf {
        self.data_dir.join(&self.documents_file)
    }

    /// Absolute `index_file` values stand alone; relative ones live under
    /// `data_dir`.
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.index_file)
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            documents_file: default_documents_file(),
            index_file: default_index_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_max_size")]
    pub max_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_size: default_chunk_max_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embed_base_url")]
    pub base_url: String,
    #[serde(default = "default_embed_model")]
    pub model: String,
    #[serde(default = "default_embed_dimension")]
    pub dimension: usize,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embed_base_url(),
            model: default_embed_model(),
            dimension: default_embed_dimension(),
            api_key: None,
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Must contain the `{context}` and `{question}` slots.
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            api_key: None,
            timeout_secs: default_llm_timeout_secs(),
            system_prompt: default_system_prompt(),
            prompt_template: default_prompt_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Results returned to the caller after re-ranking.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Vector-search pool the re-ranker works over; never below `top_k`.
    #[serde(default = "default_candidates")]
    pub candidates: usize,
    /// Lexical share of the blended score; 0 disables re-ranking.
    #[serde(default = "default_rerank_weight")]
    pub rerank_weight: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidates: default_candidates(),
            rerank_weight: default_rerank_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_budget_chars")]
    pub budget_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_chars: default_budget_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per provider call, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Deadline over the whole retrieve → generate request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token for `/query`. Set through `LARDER_API_KEY` only; never
    /// read from or written to the config file.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub generator: GeneratorConfig,
    pub retrieval: RetrievalConfig,
    pub context: ContextConfig,
    pub retry: RetryConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Reads and validates a config file, environment overrides applied.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] or [`ConfigError::Parse`] for file problems,
    /// [`ConfigError::InvalidConfig`] when the values cannot run.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config: Config = serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file means defaults rather than
    /// an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            let mut config = Self::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("LARDER_DATA_DIR") {
            self.data.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("LARDER_INDEX_PATH") {
            self.data.index_file = v;
        }
        if let Ok(v) = env::var("LARDER_EMBED_BASE_URL") {
            self.embedding.base_url = v;
        }
        if let Ok(v) = env::var("LARDER_EMBED_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = env::var("LARDER_LLM_BASE_URL") {
            self.generator.base_url = v;
        }
        if let Ok(v) = env::var("LARDER_LLM_MODEL") {
            self.generator.model = v;
        }
        if let Ok(v) = env::var("LARDER_API_KEY") {
            self.server.api_key = Some(v);
        }
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "chunking.max_size must be positive".to_string(),
            ));
        }
        if self.chunking.overlap >= self.chunking.max_size {
            return Err(ConfigError::InvalidConfig(format!(
                "chunking.overlap ({}) must be smaller than chunking.max_size ({})",
                self.chunking.overlap, self.chunking.max_size
            )));
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::InvalidConfig(
                "embedding.dimension must be positive".to_string(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(ConfigError::InvalidConfig(
                "retrieval.top_k must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.rerank_weight) {
            return Err(ConfigError::InvalidConfig(format!(
                "retrieval.rerank_weight ({}) must be within 0.0..=1.0",
                self.retrieval.rerank_weight
            )));
        }
        if self.context.budget_chars == 0 {
            return Err(ConfigError::InvalidConfig(
                "context.budget_chars must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry.max_attempts must be positive".to_string(),
            ));
        }
        for slot in ["{context}", "{question}"] {
            if !self.generator.prompt_template.contains(slot) {
                return Err(ConfigError::InvalidConfig(format!(
                    "generator.prompt_template is missing the {slot} slot"
                )));
            }
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_documents_file() -> String {
    "documents.json".to_string()
}

fn default_index_file() -> String {
    "index.json".to_string()
}

fn default_chunk_max_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    100
}

fn default_embed_base_url() -> String {
    "http://localhost:8000/v1".to_string()
}

fn default_embed_model() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}

fn default_embed_dimension() -> usize {
    384
}

fn default_embed_timeout_secs() -> u64 {
    15
}

fn default_llm_base_url() -> String {
    "http://localhost:8000/v1".to_string()
}

fn default_llm_model() -> String {
    "Qwen/Qwen2.5-7B-Instruct".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> usize {
    512
}

fn default_llm_timeout_secs() -> u64 {
    60
}

fn default_system_prompt() -> String {
    "You are a cooking assistant answering questions about a recipe \
     collection. Use only the numbered context blocks you are given. When \
     the context does not contain the answer, say so plainly instead of \
     guessing. Cite the blocks you used as [n]."
        .to_string()
}

fn default_prompt_template() -> String {
    "Context:\n{context}\nQuestion: {question}\nAnswer:".to_string()
}

fn default_top_k() -> usize {
    5
}

fn default_candidates() -> usize {
    20
}

fn default_rerank_weight() -> f32 {
    0.35
}

fn default_budget_chars() -> usize {
    4000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    90
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Env mutations are process-global; tests touching them serialize here.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = env::var(key).ok();
            env::set_var(key, value);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prior {
                Some(v) => env::set_var(self.key, v),
                None => env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunking.max_size, 1000);
        assert_eq!(config.chunking.overlap, 100);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_overlap_not_below_max_size_is_rejected() {
        let mut config = Config::default();
        config.chunking.overlap = config.chunking.max_size;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_prompt_template_must_keep_its_slots() {
        let mut config = Config::default();
        config.generator.prompt_template = "Question: {question}".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("{context}"));
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "chunking:\n  max_size: 500\nretrieval:\n  top_k: 3\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.chunking.max_size, 500);
        assert_eq!(config.chunking.overlap, 100);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.retrieval.candidates, 20);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_malformed_yaml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "chunking: [not, a, map").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides_apply_over_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _base = EnvGuard::set("LARDER_EMBED_BASE_URL", "http://embed.internal/v1");
        let _model = EnvGuard::set("LARDER_LLM_MODEL", "llm-small");
        let _key = EnvGuard::set("LARDER_API_KEY", "s3cret");

        let config = Config::load_or_default(Path::new("/nonexistent/config.yaml")).unwrap();
        assert_eq!(config.embedding.base_url, "http://embed.internal/v1");
        assert_eq!(config.generator.model, "llm-small");
        assert_eq!(config.server.api_key.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_absolute_index_path_override_wins_over_data_dir() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _path = EnvGuard::set("LARDER_INDEX_PATH", "/var/lib/larder/index.json");

        let config = Config::load_or_default(Path::new("/nonexistent/config.yaml")).unwrap();
        assert_eq!(
            config.data.index_path(),
            PathBuf::from("/var/lib/larder/index.json")
        );
    }

    #[test]
    fn test_api_key_never_reaches_serialized_config() {
        let mut config = Config::default();
        config.server.api_key = Some("s3cret".to_string());
        let rendered = serde_yaml::to_string(&config).unwrap();
        assert!(!rendered.contains("s3cret"));
    }
}
