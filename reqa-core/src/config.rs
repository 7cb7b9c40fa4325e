//! Engine configuration
//!
//! All tunables of the analysis engine live here. The configuration is read
//! from a YAML file (by default `<config_dir>/reqa/config.yaml`); any missing
//! section or field falls back to its default. Durations are stored as whole
//! seconds so the file stays readable.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the RAG server API key
pub const ENV_RAG_API_KEY: &str = "REQA_RAG_API_KEY";
/// Environment variable overriding the chat-completions API key
pub const ENV_LLM_API_KEY: &str = "REQA_LLM_API_KEY";

/// Returns the REQA configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("reqa");
    Ok(dir)
}

/// Returns the default path of the engine configuration file
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.yaml"))
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    pub workspace: WorkspaceConfig,
    pub cache: CacheConfig,
    pub fabrication: FabricationConfig,
    pub reflection: ReflectionConfig,
    pub derivation: DerivationConfig,
    pub parser: ParserConfig,
    pub backend: BackendConfig,
    /// Verification assumption catalog: key -> assumption text
    pub assumptions: BTreeMap<String, String>,
    /// Documents pushed to the RAG workspace as reference material
    pub reference_documents: Vec<ReferenceDocument>,
}

impl EngineConfig {
    /// Loads the configuration from the provided path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let mut config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;
        config.backend.apply_env_overrides();
        Ok(config)
    }

    /// Loads from an explicit path, or the default location when it exists,
    /// or returns defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let default_path = default_config_path()?;
        if default_path.exists() {
            return Self::load(default_path);
        }

        let mut config = Self::default();
        config.backend.apply_env_overrides();
        Ok(config)
    }

    /// Save the configuration to the specified path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path.as_ref()))?;
        Ok(())
    }
}

/// Request pipeline behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// First waiting window before the caller is asked what to do
    pub analysis_timeout_secs: u64,
    /// Each additional window granted by "keep waiting"
    pub retry_timeout_secs: u64,
    /// Bound on the single parse-repair request
    pub repair_timeout_secs: u64,
    /// Try the retrieval-augmented workspace before prompting directly
    pub use_rag: bool,
    /// Run each RAG analysis in its own conversation thread
    pub isolate_threads: bool,
    /// Delete transient threads after use
    pub cleanup_threads: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis_timeout_secs: 90,
            retry_timeout_secs: 30,
            repair_timeout_secs: 30,
            use_rag: true,
            isolate_threads: true,
            cleanup_threads: true,
        }
    }
}

impl PipelineConfig {
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_secs(self.retry_timeout_secs)
    }

    pub fn repair_timeout(&self) -> Duration {
        Duration::from_secs(self.repair_timeout_secs)
    }
}

/// Workspace discovery and reference-document sync
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub resolve_timeout_secs: u64,
    /// Secondary timeout for configuring a freshly created workspace
    pub configure_timeout_secs: u64,
    /// How long a resolved binding is trusted before re-validation
    pub validation_cooldown_secs: u64,
    /// Separator of prefixed workspace names, e.g. "Word Parse: <project>"
    pub pattern_marker: String,
    pub reference_sync_interval_secs: u64,
    /// Where per-workspace sync timestamps are kept (defaults to the temp dir)
    pub sync_dir: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            resolve_timeout_secs: 30,
            configure_timeout_secs: 10,
            validation_cooldown_secs: 300,
            pattern_marker: " Parse: ".to_string(),
            reference_sync_interval_secs: 24 * 60 * 60,
            sync_dir: None,
        }
    }
}

impl WorkspaceConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn configure_timeout(&self) -> Duration {
        Duration::from_secs(self.configure_timeout_secs)
    }

    pub fn validation_cooldown(&self) -> Duration {
        Duration::from_secs(self.validation_cooldown_secs)
    }

    pub fn reference_sync_interval(&self) -> Duration {
        Duration::from_secs(self.reference_sync_interval_secs)
    }

    pub fn sync_dir(&self) -> PathBuf {
        self.sync_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("reqa-workspace-sync"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Entries older than this are treated as stale (None = never)
    pub max_age_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_secs: Some(24 * 60 * 60),
        }
    }
}

/// Fabrication heuristics. The term table is deliberately configuration:
/// projects that legitimately talk about buses or standards extend or trim it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricationConfig {
    pub suspicious_terms: Vec<String>,
    /// Markers in the model's own hallucination check that admit invention
    pub self_declared_markers: Vec<String>,
    /// Ask the model once more with anti-fabrication instructions when flagged
    pub corrective_reprompt: bool,
}

impl Default for FabricationConfig {
    fn default() -> Self {
        let terms = [
            // standards references
            "IEEE", "ISO", "IEC", "MIL-STD", "ANSI", "DO-178", "RTCA", "NIST", "RFC",
            // protocol and interface jargon
            "JTAG", "SPI", "I2C", "UART", "RS-232", "RS-485", "CAN bus", "Modbus", "USB",
            "Ethernet", "TCP/IP", "Bluetooth", "PCIe", "SMBus", "ARINC",
            // precision claims
            "±", "tolerance of", "accuracy of", "precision of", "ppm", "milliseconds",
            "microseconds", "nanoseconds", "MHz", "GHz", "kHz", "dBm",
        ];
        Self {
            suspicious_terms: terms.iter().map(|t| t.to_string()).collect(),
            self_declared_markers: vec![
                "FABRICATED_DETAILS".to_string(),
                "FABRICATED".to_string(),
                "HALLUCINATED".to_string(),
            ],
            corrective_reprompt: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    pub enabled: bool,
    /// Words in a review reply that call for an improvement round
    pub improvement_keywords: Vec<String>,
    /// A non-approving review longer than this is treated as critical
    pub long_reply_chars: usize,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            improvement_keywords: ["placeholder", "vague", "generic", "missing", "incomplete", "not specific"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
            long_reply_chars: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivationConfig {
    pub max_concurrency: usize,
    pub item_timeout_secs: u64,
    /// Record a failed placeholder instead of aborting the batch
    pub continue_on_error: bool,
    /// Words that mark a sentence as testable
    pub testable_keywords: Vec<String>,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            item_timeout_secs: 120,
            continue_on_error: true,
            testable_keywords: [
                "shall", "must", "will", "should", "verify", "ensure", "provide", "support",
                "display", "detect", "measure", "report", "respond", "within", "at least",
                "no more than",
            ]
            .iter()
            .map(|k| k.to_string())
            .collect(),
        }
    }
}

impl DerivationConfig {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Recommendations containing any of these are discarded
    pub placeholder_markers: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            placeholder_markers: [
                "[Define", "[Specify", "[Insert", "[TBD", "[Enter", "[Add ", "[Placeholder",
                "[Your ", "EXAMPLE:", "<placeholder>",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
        }
    }
}

/// Endpoints of the RAG server and the chat-completions backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub rag_url: String,
    pub rag_api_key: Option<String>,
    pub llm_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            rag_url: "http://localhost:3001".to_string(),
            rag_api_key: None,
            llm_url: "http://localhost:11434/v1".to_string(),
            llm_model: "llama3.1".to_string(),
            llm_api_key: None,
            temperature: 0.2,
            request_timeout_secs: 300,
        }
    }
}

impl BackendConfig {
    /// Environment variables win over the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var(ENV_RAG_API_KEY) {
            if !key.is_empty() {
                self.rag_api_key = Some(key);
            }
        }
        if let Ok(key) = std::env::var(ENV_LLM_API_KEY) {
            if !key.is_empty() {
                self.llm_api_key = Some(key);
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// A reference document pushed to the RAG workspace
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceDocument {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub content: Option<String>,
}

impl ReferenceDocument {
    /// Inline content wins over the file path
    pub fn read_content(&self) -> Result<String> {
        if let Some(content) = &self.content {
            return Ok(content.clone());
        }
        match &self.path {
            Some(path) => fs::read_to_string(path)
                .with_context(|| format!("Failed to read reference document: {:?}", path)),
            None => anyhow::bail!("Reference document '{}' has neither content nor path", self.name),
        }
    }
}
