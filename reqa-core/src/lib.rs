pub mod ai;
pub mod config;
pub mod models;
pub mod storage;

// Re-export commonly used types
pub use ai::{
    AiError, AnalysisEngine, AnythingLlmClient, ChatCompletionsClient, EngineEvent,
    PipelineState, TimeoutDecider, TimeoutDecision,
};
pub use config::{default_config_path, get_config_dir, BackendConfig, EngineConfig};
pub use models::{
    Analysis, AnalysisErrorKind, AnalysisMode, Issue, Recommendation, Requirement,
    RequirementSet, RequirementTable,
};
pub use storage::{Storage, StorageError};
