//! AI Integration Module
//!
//! Requirement quality analysis against a retrieval-augmented backend with a
//! direct-model fallback, plus capability derivation and coverage checks.

pub mod anythingllm;
pub mod cache;
pub mod client;
pub mod derivation;
pub mod events;
pub mod guard;
pub mod openai_compat;
pub mod pipeline;
pub mod prompts;
pub mod reflection;
pub mod responses;
pub mod sync;
pub mod workspace;

#[cfg(test)]
pub mod testing;

pub use anythingllm::AnythingLlmClient;
pub use cache::{AnalysisCache, CacheStatistics};
pub use client::{
    AiError, AiResult, HealthMonitor, HealthStatus, RagBackend, ServiceStatus, TextGenerator,
    Workspace,
};
pub use derivation::{
    CapabilityDeriver, DerivationEngine, DerivationResult, DerivedCapability, GapAnalysisResult,
    GapAnalyzer, LlmCapabilityDeriver, RequirementGapReport, TestingWorkflowValidation,
    WorkflowIssue, WorkflowSeverity,
};
pub use events::{BroadcastPublisher, EngineEvent, EventPublisher, NullPublisher};
pub use guard::{FabricationGuard, FabricationKind};
pub use openai_compat::ChatCompletionsClient;
pub use pipeline::{
    AbortOnTimeout, AnalysisEngine, EngineBuilder, ExternalDelegate, PipelineState,
    TimeoutDecider, TimeoutDecision,
};
pub use workspace::WorkspaceResolver;
