//! Request Pipeline
//!
//! [`AnalysisEngine`] orchestrates one requirement analysis: cache lookup,
//! workspace resolution, a retrieval-augmented attempt with fallback to a
//! direct prompt, parsing with a single repair round, the fabrication guard
//! and the optional self-review. Long waits become decision points answered
//! by an injected [`TimeoutDecider`].

use crate::ai::cache::{AnalysisCache, CacheStatistics};
use crate::ai::client::{
    AiError, AiResult, ChunkCallback, HealthMonitor, ProgressCallback, RagBackend,
    ServiceStatus, TextGenerator,
};
use crate::ai::derivation::{
    BatchProgressCallback, CapabilityDeriver, DerivationEngine, DerivationResult,
    DerivedCapability, GapAnalysisResult, GapAnalyzer, RequirementGapReport,
    TestingWorkflowValidation,
};
use crate::ai::events::{EngineEvent, EventPublisher, NullPublisher};
use crate::ai::guard::FabricationGuard;
use crate::ai::prompts::{
    build_anti_fabrication_prompt, build_external_prompt, build_repair_prompt,
    build_requirement_prompt, system_prompt,
};
use crate::ai::reflection::SelfReflection;
use crate::ai::responses::ResponseParser;
use crate::ai::sync::SyncTracker;
use crate::ai::workspace::WorkspaceResolver;
use crate::config::EngineConfig;
use crate::models::{Analysis, AnalysisErrorKind, AnalysisMode, Requirement};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where an analysis currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    CheckingCache,
    CacheHit,
    ResolvingWorkspace,
    TryingRag,
    RagSuccess,
    RagFailure,
    FallbackDirect,
    Parsing,
    GuardingFabrication,
    Reflecting,
    TimedOut,
    AwaitingUserDecision,
    Done,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match self {
            Idle => matches!(next, CheckingCache | Cancelled),
            CheckingCache => matches!(
                next,
                CacheHit | ResolvingWorkspace | FallbackDirect | Done | Cancelled
            ),
            CacheHit => next == Done,
            ResolvingWorkspace => matches!(next, TryingRag | RagFailure | TimedOut | Cancelled),
            TryingRag => matches!(next, RagSuccess | RagFailure | TimedOut | Cancelled),
            RagSuccess => next == Parsing,
            RagFailure => matches!(next, FallbackDirect | Cancelled),
            FallbackDirect => matches!(next, Parsing | TimedOut | Done | Cancelled),
            Parsing => matches!(next, GuardingFabrication | Done | Cancelled),
            GuardingFabrication => matches!(next, Reflecting | Done | Cancelled),
            Reflecting => matches!(next, Done | Cancelled),
            TimedOut => next == AwaitingUserDecision,
            // the in-flight attempt keeps running while the decision is pending
            AwaitingUserDecision => matches!(
                next,
                ResolvingWorkspace
                    | TryingRag
                    | RagSuccess
                    | RagFailure
                    | FallbackDirect
                    | Parsing
                    | Done
                    | Cancelled
            ),
            Done | Cancelled => false,
        }
    }
}

/// Answer to "the analysis is taking long, keep waiting?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    KeepWaiting,
    /// Stop the analysis; optionally hand the prompt to an external model
    Abort { export_prompt: bool },
}

#[async_trait]
pub trait TimeoutDecider: Send + Sync {
    /// `window` counts from 1; `waited` is the total time spent so far
    async fn decide(&self, requirement_id: &str, waited: Duration, window: u32)
        -> TimeoutDecision;
}

/// Aborts at the first decision point
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnTimeout;

#[async_trait]
impl TimeoutDecider for AbortOnTimeout {
    async fn decide(&self, requirement_id: &str, waited: Duration, _window: u32) -> TimeoutDecision {
        info!(requirement_id, waited_secs = waited.as_secs(), "analysis timed out, aborting");
        TimeoutDecision::Abort {
            export_prompt: false,
        }
    }
}

/// Receives prompts meant for a model outside the engine
pub trait ExternalDelegate: Send + Sync {
    fn deliver_prompt(&self, requirement_id: &str, prompt: &str);
}

/// A transient conversation thread, deleted when dropped
struct ThreadLease {
    backend: Arc<dyn RagBackend>,
    workspace: String,
    thread: String,
    cleanup: bool,
}

impl ThreadLease {
    fn thread_slug(&self) -> &str {
        &self.thread
    }
}

impl Drop for ThreadLease {
    fn drop(&mut self) {
        if !self.cleanup {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let workspace = std::mem::take(&mut self.workspace);
        let thread = std::mem::take(&mut self.thread);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    // fresh token: the attempt's token may already be cancelled
                    let cancel = CancellationToken::new();
                    match backend.delete_thread(&workspace, &thread, &cancel).await {
                        Ok(()) => debug!(slug = %workspace, thread = %thread, "thread deleted"),
                        Err(e) => warn!(slug = %workspace, thread = %thread, error = %e, "thread deletion failed"),
                    }
                });
            }
            Err(_) => warn!(slug = %workspace, thread = %thread, "no runtime, thread left behind"),
        }
    }
}

/// Per-analysis state holder; publishes every transition
struct StateTracker<'a> {
    requirement_id: &'a str,
    current: Mutex<PipelineState>,
    states: &'a RwLock<HashMap<String, PipelineState>>,
    events: &'a dyn EventPublisher,
}

impl<'a> StateTracker<'a> {
    fn new(
        requirement_id: &'a str,
        states: &'a RwLock<HashMap<String, PipelineState>>,
        events: &'a dyn EventPublisher,
    ) -> Self {
        Self {
            requirement_id,
            current: Mutex::new(PipelineState::Idle),
            states,
            events,
        }
    }

    fn current(&self) -> PipelineState {
        self.current
            .lock()
            .map(|s| *s)
            .unwrap_or(PipelineState::Idle)
    }

    fn set(&self, next: PipelineState) {
        if let Ok(mut current) = self.current.lock() {
            if !current.can_transition_to(next) {
                warn!(
                    requirement_id = self.requirement_id,
                    from = ?*current,
                    to = ?next,
                    "unexpected pipeline transition"
                );
            }
            *current = next;
        }
        if let Ok(mut states) = self.states.write() {
            if next.is_terminal() {
                states.remove(self.requirement_id);
            } else {
                states.insert(self.requirement_id.to_string(), next);
            }
        }
        debug!(requirement_id = self.requirement_id, state = ?next, "pipeline state");
        self.events.publish(EngineEvent::StateChanged {
            requirement_id: self.requirement_id.to_string(),
            state: next,
        });
    }
}

/// Builder for [`AnalysisEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    generator: Arc<dyn TextGenerator>,
    rag: Option<Arc<dyn RagBackend>>,
    health: Option<Arc<dyn HealthMonitor>>,
    decider: Arc<dyn TimeoutDecider>,
    delegate: Option<Arc<dyn ExternalDelegate>>,
    events: Arc<dyn EventPublisher>,
    deriver: Option<Arc<dyn CapabilityDeriver>>,
    gap_analyzer: Option<Arc<dyn GapAnalyzer>>,
}

impl EngineBuilder {
    pub fn rag_backend(mut self, rag: Arc<dyn RagBackend>) -> Self {
        self.rag = Some(rag);
        self
    }

    pub fn health_monitor(mut self, health: Arc<dyn HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn timeout_decider(mut self, decider: Arc<dyn TimeoutDecider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn external_delegate(mut self, delegate: Arc<dyn ExternalDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn capability_deriver(mut self, deriver: Arc<dyn CapabilityDeriver>) -> Self {
        self.deriver = Some(deriver);
        self
    }

    pub fn gap_analyzer(mut self, analyzer: Arc<dyn GapAnalyzer>) -> Self {
        self.gap_analyzer = Some(analyzer);
        self
    }

    pub fn build(self) -> AnalysisEngine {
        let config = self.config;
        let resolver = self.rag.as_ref().map(|rag| {
            WorkspaceResolver::new(
                Arc::clone(rag),
                config.workspace.clone(),
                Arc::clone(&self.events),
            )
        });
        let sync = SyncTracker::new(
            config.workspace.sync_dir(),
            config.workspace.reference_sync_interval(),
        );
        let derivation = DerivationEngine::new(
            config.derivation.clone(),
            self.deriver,
            self.gap_analyzer,
            Arc::clone(&self.events),
        );

        AnalysisEngine {
            cache: AnalysisCache::new(&config.cache),
            parser: ResponseParser::new(&config.parser),
            guard: FabricationGuard::new(&config.fabrication),
            reflection: SelfReflection::new(&config.reflection),
            system_prompt: system_prompt(),
            generator: self.generator,
            rag: self.rag,
            resolver,
            sync,
            health: self.health,
            decider: self.decider,
            delegate: self.delegate,
            events: self.events,
            derivation,
            states: RwLock::new(HashMap::new()),
            config,
        }
    }
}

/// The requirement quality analysis engine
pub struct AnalysisEngine {
    config: EngineConfig,
    generator: Arc<dyn TextGenerator>,
    rag: Option<Arc<dyn RagBackend>>,
    resolver: Option<WorkspaceResolver>,
    sync: SyncTracker,
    health: Option<Arc<dyn HealthMonitor>>,
    decider: Arc<dyn TimeoutDecider>,
    delegate: Option<Arc<dyn ExternalDelegate>>,
    events: Arc<dyn EventPublisher>,
    cache: AnalysisCache,
    parser: ResponseParser,
    guard: FabricationGuard,
    reflection: SelfReflection,
    system_prompt: String,
    derivation: DerivationEngine,
    states: RwLock<HashMap<String, PipelineState>>,
}

impl AnalysisEngine {
    pub fn builder(config: EngineConfig, generator: Arc<dyn TextGenerator>) -> EngineBuilder {
        EngineBuilder {
            config,
            generator,
            rag: None,
            health: None,
            decider: Arc::new(AbortOnTimeout),
            delegate: None,
            events: Arc::new(NullPublisher),
            deriver: None,
            gap_analyzer: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// State of an analysis still in flight
    pub fn state_of(&self, requirement_id: &str) -> Option<PipelineState> {
        self.states
            .read()
            .ok()
            .and_then(|s| s.get(requirement_id).copied())
    }

    pub async fn analyze_requirement(
        &self,
        req: &Requirement,
        cancel: &CancellationToken,
    ) -> Analysis {
        self.run(req, None, None, cancel).await
    }

    pub async fn analyze_requirement_with_streaming(
        &self,
        req: &Requirement,
        on_partial: ChunkCallback<'_>,
        on_progress: ProgressCallback<'_>,
        cancel: &CancellationToken,
    ) -> Analysis {
        self.run(req, Some(on_partial), Some(on_progress), cancel)
            .await
    }

    /// The context prompt exactly as it would be sent
    pub fn generate_prompt_for_inspection(&self, req: &Requirement) -> String {
        build_requirement_prompt(req, &self.config.assumptions)
    }

    /// System and context prompt combined for a model outside the engine.
    /// Also handed to the external delegate when one is installed.
    pub fn export_prompt_for_external_use(&self, req: &Requirement) -> String {
        let prompt = build_external_prompt(
            &self.system_prompt,
            &self.generate_prompt_for_inspection(req),
        );
        if let Some(delegate) = &self.delegate {
            delegate.deliver_prompt(&req.id, &prompt);
        }
        prompt
    }

    pub fn set_workspace_context(&self, name: &str) {
        match &self.resolver {
            Some(resolver) => resolver.set_context(name),
            None => debug!(context = name, "no RAG backend, workspace context ignored"),
        }
    }

    pub fn invalidate_cache(&self, requirement_id: &str) {
        self.cache.invalidate(requirement_id);
    }

    pub fn clear_analysis_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_statistics(&self) -> CacheStatistics {
        self.cache.statistics()
    }

    pub async fn analyze_requirement_derivation(
        &self,
        req: &Requirement,
        cancel: &CancellationToken,
    ) -> DerivationResult {
        self.derivation.analyze_requirement_derivation(req, cancel).await
    }

    pub async fn analyze_gap(
        &self,
        capabilities: &[DerivedCapability],
        requirements: &[Requirement],
        cancel: &CancellationToken,
    ) -> GapAnalysisResult {
        self.derivation
            .analyze_gap(capabilities, requirements, cancel)
            .await
    }

    pub async fn analyze_requirement_gap(
        &self,
        req: &Requirement,
        all: &[Requirement],
        cancel: &CancellationToken,
    ) -> RequirementGapReport {
        self.derivation.analyze_requirement_gap(req, all, cancel).await
    }

    pub async fn validate_testing_workflow(
        &self,
        reqs: &[Requirement],
        cancel: &CancellationToken,
    ) -> AiResult<TestingWorkflowValidation> {
        self.derivation.validate_testing_workflow(reqs, cancel).await
    }

    pub async fn analyze_batch_derivation(
        &self,
        reqs: &[Requirement],
        max_concurrency: usize,
        progress: Option<BatchProgressCallback<'_>>,
        cancel: &CancellationToken,
    ) -> AiResult<Vec<DerivationResult>> {
        self.derivation
            .analyze_batch_derivation(reqs, max_concurrency, progress, cancel)
            .await
    }

    async fn run(
        &self,
        req: &Requirement,
        on_partial: Option<ChunkCallback<'_>>,
        on_progress: Option<ProgressCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Analysis {
        let started = Instant::now();
        let tracker = StateTracker::new(&req.id, &self.states, self.events.as_ref());

        if cancel.is_cancelled() {
            tracker.set(PipelineState::Cancelled);
            return cancelled();
        }

        tracker.set(PipelineState::CheckingCache);
        if let Some(hit) = self.cache.try_get(req) {
            tracker.set(PipelineState::CacheHit);
            tracker.set(PipelineState::Done);
            self.completed(&req.id, true, true);
            return hit;
        }

        let mut use_rag = self.config.pipeline.use_rag && self.rag.is_some();
        if let Some(health) = &self.health {
            let limit = self.config.workspace.resolve_timeout();
            let checked = match timeout(limit, health.check_health(cancel)).await {
                Ok(result) => result,
                Err(_) => Err(AiError::Timeout(limit.as_secs())),
            };
            match checked {
                Ok(status) if status.status == ServiceStatus::Unavailable && !status.is_using_fallback => {
                    warn!(requirement_id = %req.id, "model backend unavailable");
                    tracker.set(PipelineState::Done);
                    let analysis = Analysis::failed(
                        AnalysisErrorKind::ServiceNotAvailable,
                        AiError::ServiceNotAvailable("health check reported unavailable".to_string())
                            .to_string(),
                    );
                    self.completed(&req.id, false, false);
                    return analysis;
                }
                Ok(status) if status.is_using_fallback => {
                    info!(requirement_id = %req.id, "backend is on its fallback model, skipping retrieval");
                    use_rag = false;
                }
                Ok(_) => {}
                Err(e) => warn!(requirement_id = %req.id, error = %e, "health check failed, continuing"),
            }
        }

        let prompt = self.generate_prompt_for_inspection(req);
        let attempt_cancel = cancel.child_token();
        let attempt = self.obtain_response(
            req,
            &prompt,
            use_rag,
            on_partial,
            on_progress,
            &tracker,
            &attempt_cancel,
        );

        let (raw, mode) = match self
            .await_with_decisions(req, &prompt, attempt, &tracker, &attempt_cancel, cancel)
            .await
        {
            Ok(response) => response,
            Err(AiError::Cancelled) => return self.cancelled_run(&req.id, &tracker),
            Err(e) => {
                warn!(requirement_id = %req.id, error = %e, "analysis failed");
                tracker.set(PipelineState::Done);
                self.completed(&req.id, false, false);
                return Analysis::failed(e.kind(), e.to_string());
            }
        };

        tracker.set(PipelineState::Parsing);
        let mut analysis = match self.parse_or_repair(&raw, &req.id, &attempt_cancel).await {
            Some(analysis) => analysis,
            None if cancel.is_cancelled() => return self.cancelled_run(&req.id, &tracker),
            None => {
                tracker.set(PipelineState::Done);
                self.completed(&req.id, false, false);
                return Analysis::failed(
                    AnalysisErrorKind::ParseError,
                    AiError::ParseError("response could not be parsed after repair".to_string())
                        .to_string(),
                );
            }
        };
        analysis.mode = Some(mode);

        tracker.set(PipelineState::GuardingFabrication);
        let original_text = req.full_text();
        let mut analysis = self
            .guard_analysis(req, &prompt, analysis, &original_text, mode, &attempt_cancel)
            .await;
        if cancel.is_cancelled() {
            return self.cancelled_run(&req.id, &tracker);
        }

        if self.config.reflection.enabled {
            tracker.set(PipelineState::Reflecting);
            let revised = self
                .reflection
                .reflect(&raw, &prompt, |p| self.follow_up(p, &attempt_cancel))
                .await;
            if revised != raw {
                match self.parser.parse_response(&revised, &req.id) {
                    Some(mut revision) => {
                        revision.mode = Some(mode);
                        let outcome = self.guard.check(revision, &original_text);
                        analysis = outcome.analysis;
                        debug!(requirement_id = %req.id, "adopted self-reviewed analysis");
                    }
                    None => debug!(requirement_id = %req.id, "revision did not parse, keeping original"),
                }
            }
            if cancel.is_cancelled() {
                return self.cancelled_run(&req.id, &tracker);
            }
        }

        tracker.set(PipelineState::Done);
        self.cache.store(req, &analysis);
        info!(
            requirement_id = %req.id,
            score = analysis.original_quality_score,
            mode = ?mode,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis complete"
        );
        self.completed(&req.id, false, true);
        analysis
    }

    fn cancelled_run(&self, requirement_id: &str, tracker: &StateTracker<'_>) -> Analysis {
        debug!(requirement_id, "analysis cancelled");
        tracker.set(PipelineState::Cancelled);
        self.completed(requirement_id, false, false);
        cancelled()
    }

    fn completed(&self, requirement_id: &str, from_cache: bool, is_analyzed: bool) {
        self.events.publish(EngineEvent::AnalysisCompleted {
            requirement_id: requirement_id.to_string(),
            from_cache,
            is_analyzed,
        });
    }

    /// Retrieval-augmented attempt first, direct prompt on any RAG failure
    #[allow(clippy::too_many_arguments)]
    async fn obtain_response(
        &self,
        req: &Requirement,
        prompt: &str,
        use_rag: bool,
        on_partial: Option<ChunkCallback<'_>>,
        on_progress: Option<ProgressCallback<'_>>,
        tracker: &StateTracker<'_>,
        cancel: &CancellationToken,
    ) -> AiResult<(String, AnalysisMode)> {
        if use_rag {
            match self
                .try_rag(req, prompt, on_partial, on_progress, tracker, cancel)
                .await
            {
                Ok(text) => {
                    tracker.set(PipelineState::RagSuccess);
                    return Ok((text, AnalysisMode::Rag));
                }
                Err(AiError::Cancelled) => return Err(AiError::Cancelled),
                Err(e) => {
                    tracker.set(PipelineState::RagFailure);
                    warn!(requirement_id = %req.id, error = %e, "retrieval attempt failed, using direct prompt");
                    if matches!(e, AiError::WorkspaceNotConfigured(_)) {
                        if let Some(resolver) = &self.resolver {
                            resolver.invalidate();
                        }
                    }
                    self.events.publish(EngineEvent::DegradedMode {
                        requirement_id: req.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracker.set(PipelineState::FallbackDirect);
        if let Some(progress) = on_progress {
            progress("Analyzing without retrieval context");
        }
        let text = self
            .generator
            .generate_with_system(&self.system_prompt, prompt, cancel)
            .await?;
        if text.trim().is_empty() {
            return Err(AiError::EmptyResponse);
        }
        if let Some(chunk) = on_partial {
            chunk(&text);
        }
        Ok((text, AnalysisMode::Direct))
    }

    async fn try_rag(
        &self,
        req: &Requirement,
        prompt: &str,
        on_partial: Option<ChunkCallback<'_>>,
        on_progress: Option<ProgressCallback<'_>>,
        tracker: &StateTracker<'_>,
        cancel: &CancellationToken,
    ) -> AiResult<String> {
        let (Some(rag), Some(resolver)) = (&self.rag, &self.resolver) else {
            return Err(AiError::WorkspaceNotConfigured("no RAG backend".to_string()));
        };

        tracker.set(PipelineState::ResolvingWorkspace);
        if let Some(progress) = on_progress {
            progress("Resolving workspace");
        }
        let context = resolver
            .context()
            .ok_or_else(|| AiError::WorkspaceNotConfigured("no project context".to_string()))?;
        let binding = resolver
            .ensure_binding(&context, cancel)
            .await
            .ok_or_else(|| AiError::WorkspaceNotConfigured(context.clone()))?;

        self.sync
            .sync_if_due(rag.as_ref(), &binding.slug, &self.config.reference_documents)
            .await;

        tracker.set(PipelineState::TryingRag);
        let message = if binding.system_prompt_configured {
            prompt.to_string()
        } else {
            build_external_prompt(&self.system_prompt, prompt)
        };

        let lease = if self.config.pipeline.isolate_threads {
            let name = format!("reqa-{}-{}", req.id, &Uuid::new_v4().simple().to_string()[..8]);
            match rag.create_thread(&binding.slug, &name, cancel).await? {
                Some(thread) => Some(ThreadLease {
                    backend: Arc::clone(rag),
                    workspace: binding.slug.clone(),
                    thread,
                    cleanup: self.config.pipeline.cleanup_threads,
                }),
                None => return Err(AiError::ThreadCreationFailed(binding.slug.clone())),
            }
        } else {
            None
        };

        let text = rag
            .send_chat_message_streaming(
                &binding.slug,
                &message,
                on_partial,
                on_progress,
                lease.as_ref().map(ThreadLease::thread_slug),
                cancel,
            )
            .await?;
        drop(lease);

        if text.trim().is_empty() {
            return Err(AiError::EmptyResponse);
        }
        Ok(text)
    }

    /// Drive `attempt` through successive decision windows
    async fn await_with_decisions<F>(
        &self,
        req: &Requirement,
        prompt: &str,
        attempt: F,
        tracker: &StateTracker<'_>,
        attempt_cancel: &CancellationToken,
        caller_cancel: &CancellationToken,
    ) -> AiResult<(String, AnalysisMode)>
    where
        F: Future<Output = AiResult<(String, AnalysisMode)>>,
    {
        tokio::pin!(attempt);
        let mut window = self.config.pipeline.analysis_timeout();
        let mut window_no: u32 = 1;
        let mut waited = Duration::ZERO;

        loop {
            tokio::select! {
                biased;
                _ = caller_cancel.cancelled() => {
                    attempt_cancel.cancel();
                    return Err(AiError::Cancelled);
                }
                result = &mut attempt => return result,
                _ = tokio::time::sleep(window) => {}
            }

            waited += window;
            let before_timeout = tracker.current();
            tracker.set(PipelineState::TimedOut);
            warn!(
                requirement_id = %req.id,
                waited_secs = waited.as_secs(),
                window = window_no,
                "analysis is taking longer than expected"
            );
            self.events.publish(EngineEvent::TimeoutReached {
                requirement_id: req.id.clone(),
                window: window_no,
                waited_secs: waited.as_secs(),
            });
            tracker.set(PipelineState::AwaitingUserDecision);

            let decision = tokio::select! {
                biased;
                _ = caller_cancel.cancelled() => {
                    attempt_cancel.cancel();
                    return Err(AiError::Cancelled);
                }
                result = &mut attempt => return result,
                decision = self.decider.decide(&req.id, waited, window_no) => decision,
            };

            match decision {
                TimeoutDecision::KeepWaiting => {
                    debug!(requirement_id = %req.id, "continuing to wait");
                    // the attempt may have moved on while the decision was pending
                    if tracker.current() == PipelineState::AwaitingUserDecision {
                        tracker.set(before_timeout);
                    }
                    window = self.config.pipeline.retry_timeout();
                    window_no += 1;
                }
                TimeoutDecision::Abort { export_prompt } => {
                    attempt_cancel.cancel();
                    if export_prompt {
                        self.deliver_external_prompt(&req.id, prompt);
                    }
                    return Err(AiError::Cancelled);
                }
            }
        }
    }

    fn deliver_external_prompt(&self, requirement_id: &str, prompt: &str) {
        match &self.delegate {
            Some(delegate) => {
                let external = build_external_prompt(&self.system_prompt, prompt);
                delegate.deliver_prompt(requirement_id, &external);
            }
            None => warn!(requirement_id, "prompt export requested but no external delegate installed"),
        }
    }

    /// A secondary request through the direct generator, bounded by the
    /// repair timeout
    async fn follow_up(&self, prompt: String, cancel: &CancellationToken) -> AiResult<String> {
        let limit = self.config.pipeline.repair_timeout();
        match timeout(
            limit,
            self.generator
                .generate_with_system(&self.system_prompt, &prompt, cancel),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AiError::Timeout(limit.as_secs())),
        }
    }

    async fn parse_or_repair(
        &self,
        raw: &str,
        requirement_id: &str,
        cancel: &CancellationToken,
    ) -> Option<Analysis> {
        if let Some(analysis) = self.parser.parse_response(raw, requirement_id) {
            return Some(analysis);
        }

        info!(requirement_id, "response not parseable, requesting a repair");
        match self.follow_up(build_repair_prompt(raw), cancel).await {
            Ok(repaired) => self.parser.parse_response(&repaired, requirement_id),
            Err(e) => {
                warn!(requirement_id, error = %e, "repair request failed");
                None
            }
        }
    }

    async fn guard_analysis(
        &self,
        req: &Requirement,
        prompt: &str,
        analysis: Analysis,
        original_text: &str,
        mode: AnalysisMode,
        cancel: &CancellationToken,
    ) -> Analysis {
        let outcome = self.guard.check(analysis, original_text);
        let Some(kind) = outcome.kind.filter(|_| outcome.flagged) else {
            return outcome.analysis;
        };

        self.events.publish(EngineEvent::FabricationFlagged {
            requirement_id: req.id.clone(),
            kind,
        });

        if !self.config.fabrication.corrective_reprompt {
            return outcome.analysis;
        }

        info!(requirement_id = %req.id, "asking once more without invented detail");
        let corrective = build_anti_fabrication_prompt(prompt, &outcome.suspicious_terms);
        let retry = match self.follow_up(corrective, cancel).await {
            Ok(text) => self.parser.parse_response(&text, &req.id),
            Err(e) => {
                warn!(requirement_id = %req.id, error = %e, "corrective request failed");
                None
            }
        };

        match retry.map(|a| self.guard.check(a, original_text)) {
            Some(second) if !second.flagged => {
                let mut adopted = second.analysis;
                adopted.mode = Some(mode);
                adopted
            }
            _ => outcome.analysis,
        }
    }
}

fn cancelled() -> Analysis {
    Analysis::failed(AnalysisErrorKind::Cancelled, "Analysis cancelled")
}
