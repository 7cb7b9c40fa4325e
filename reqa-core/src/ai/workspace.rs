//! Workspace Resolver
//!
//! Maps the current project context onto a workspace of the RAG backend.
//! Existing workspaces are matched by name (exact, `"<kind> Parse: <project>"`
//! pattern, normalized equality, then normalized containment); when nothing
//! matches a workspace is created and configured. The binding is cached and
//! only re-validated once its cooldown has expired.

use crate::ai::client::{RagBackend, Workspace};
use crate::ai::events::{EngineEvent, EventPublisher};
use crate::config::WorkspaceConfig;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A resolved project context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceBinding {
    pub context: String,
    pub slug: String,
    pub system_prompt_configured: bool,
    pub validated_at: Instant,
}

/// Lowercase and drop everything that is not a letter or digit
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// The project part of a `"<kind><marker><project>"` workspace name
fn pattern_project<'a>(name: &'a str, marker: &str) -> Option<&'a str> {
    if marker.is_empty() {
        return None;
    }
    let (kind, project) = name.split_once(marker)?;
    if kind.trim().is_empty() || project.trim().is_empty() {
        return None;
    }
    Some(project.trim())
}

/// Pick the workspace that best matches `context`; first rule wins
pub fn find_matching_workspace<'a>(
    workspaces: &'a [Workspace],
    context: &str,
    pattern_marker: &str,
) -> Option<&'a Workspace> {
    let context = context.trim();
    if context.is_empty() {
        return None;
    }

    if let Some(ws) = workspaces.iter().find(|w| w.name.trim() == context) {
        return Some(ws);
    }

    if let Some(ws) = workspaces.iter().find(|w| {
        pattern_project(&w.name, pattern_marker)
            .map(|project| project.eq_ignore_ascii_case(context))
            .unwrap_or(false)
    }) {
        return Some(ws);
    }

    let target = normalize_name(context);
    if target.is_empty() {
        return None;
    }

    if let Some(ws) = workspaces.iter().find(|w| normalize_name(&w.name) == target) {
        return Some(ws);
    }

    workspaces.iter().find(|w| {
        let whole = normalize_name(&w.name);
        let suffix = pattern_project(&w.name, pattern_marker)
            .map(normalize_name)
            .unwrap_or_default();
        [whole, suffix]
            .iter()
            .filter(|candidate| !candidate.is_empty())
            .any(|candidate| candidate.contains(&target) || target.contains(candidate.as_str()))
    })
}

pub struct WorkspaceResolver {
    backend: Arc<dyn RagBackend>,
    config: WorkspaceConfig,
    events: Arc<dyn EventPublisher>,
    context: RwLock<Option<String>>,
    binding: RwLock<Option<WorkspaceBinding>>,
    /// Serialises resolution so concurrent callers never create duplicates
    resolving: Mutex<()>,
}

impl WorkspaceResolver {
    pub fn new(
        backend: Arc<dyn RagBackend>,
        config: WorkspaceConfig,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            backend,
            config,
            events,
            context: RwLock::new(None),
            binding: RwLock::new(None),
            resolving: Mutex::new(()),
        }
    }

    /// Switch the project context. A binding for another context is dropped.
    pub fn set_context(&self, name: &str) {
        let name = name.trim().to_string();
        if let Ok(mut context) = self.context.write() {
            if context.as_deref() == Some(name.as_str()) {
                return;
            }
            *context = Some(name.clone());
        }
        if let Ok(mut binding) = self.binding.write() {
            if binding.as_ref().map(|b| b.context != name).unwrap_or(false) {
                *binding = None;
            }
        }
        info!(context = %name, "workspace context set");
        self.events
            .publish(EngineEvent::WorkspaceContextChanged { context: name });
    }

    pub fn context(&self) -> Option<String> {
        self.context.read().ok().and_then(|c| c.clone())
    }

    pub fn binding(&self) -> Option<WorkspaceBinding> {
        self.binding.read().ok().and_then(|b| b.clone())
    }

    /// Forget the cached binding, e.g. after the workspace disappeared
    pub fn invalidate(&self) {
        if let Ok(mut binding) = self.binding.write() {
            if let Some(old) = binding.take() {
                debug!(slug = %old.slug, "workspace binding invalidated");
            }
        }
    }

    /// Resolve the workspace slug for `project_context`, or `None` when no
    /// workspace can be found or created in time
    pub async fn ensure_workspace(
        &self,
        project_context: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        self.ensure_binding(project_context, cancel)
            .await
            .map(|binding| binding.slug)
    }

    pub async fn ensure_binding(
        &self,
        project_context: &str,
        cancel: &CancellationToken,
    ) -> Option<WorkspaceBinding> {
        let project_context = project_context.trim();
        if project_context.is_empty() {
            return None;
        }

        if let Some(fresh) = self.fresh_binding(project_context) {
            return Some(fresh);
        }

        let _guard = self.resolving.lock().await;

        // another caller may have finished while we waited
        if let Some(fresh) = self.fresh_binding(project_context) {
            return Some(fresh);
        }

        if let Some(expired) = self.binding().filter(|b| b.context == project_context) {
            return Some(self.revalidate(expired, cancel).await);
        }

        let started = Instant::now();
        match timeout(
            self.config.resolve_timeout(),
            self.resolve(project_context, cancel),
        )
        .await
        {
            Ok(Some(binding)) => {
                debug!(
                    slug = %binding.slug,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "workspace resolved"
                );
                if let Ok(mut slot) = self.binding.write() {
                    *slot = Some(binding.clone());
                }
                Some(binding)
            }
            Ok(None) => None,
            Err(_) => {
                warn!(
                    context = %project_context,
                    timeout_secs = self.config.resolve_timeout_secs,
                    "workspace resolution timed out"
                );
                None
            }
        }
    }

    fn fresh_binding(&self, project_context: &str) -> Option<WorkspaceBinding> {
        let cooldown = self.config.validation_cooldown();
        self.binding()
            .filter(|b| b.context == project_context && b.validated_at.elapsed() < cooldown)
    }

    /// One configuration round-trip after the cooldown has expired
    async fn revalidate(
        &self,
        mut binding: WorkspaceBinding,
        cancel: &CancellationToken,
    ) -> WorkspaceBinding {
        debug!(slug = %binding.slug, "re-validating workspace configuration");
        binding.system_prompt_configured = self
            .configure(&binding.slug, cancel)
            .await
            .unwrap_or(binding.system_prompt_configured);
        binding.validated_at = Instant::now();
        if let Ok(mut slot) = self.binding.write() {
            *slot = Some(binding.clone());
        }
        binding
    }

    async fn resolve(
        &self,
        project_context: &str,
        cancel: &CancellationToken,
    ) -> Option<WorkspaceBinding> {
        let workspaces = match self.backend.list_workspaces(cancel).await {
            Ok(workspaces) => workspaces,
            Err(e) => {
                warn!(error = %e, "could not list workspaces");
                return None;
            }
        };

        let (workspace, created) = match find_matching_workspace(
            &workspaces,
            project_context,
            &self.config.pattern_marker,
        ) {
            Some(found) => (found.clone(), false),
            None => {
                info!(context = %project_context, "no matching workspace, creating one");
                match self.backend.create_workspace(project_context, cancel).await {
                    Ok(Some(workspace)) => (workspace, true),
                    Ok(None) => {
                        warn!(context = %project_context, "workspace creation returned nothing");
                        return None;
                    }
                    Err(e) => {
                        warn!(context = %project_context, error = %e, "workspace creation failed");
                        return None;
                    }
                }
            }
        };

        let configured = self.configure(&workspace.slug, cancel).await.unwrap_or(false);

        self.events.publish(EngineEvent::WorkspaceResolved {
            context: project_context.to_string(),
            slug: workspace.slug.clone(),
            created,
        });

        Some(WorkspaceBinding {
            context: project_context.to_string(),
            slug: workspace.slug,
            system_prompt_configured: configured,
            validated_at: Instant::now(),
        })
    }

    /// Apply workspace settings under the configuration timeout.
    /// `None` means the attempt failed; failure is never fatal.
    async fn configure(&self, slug: &str, cancel: &CancellationToken) -> Option<bool> {
        match timeout(
            self.config.configure_timeout(),
            self.backend.configure_workspace_settings(slug, cancel),
        )
        .await
        {
            Ok(Ok(configured)) => {
                if !configured {
                    warn!(slug, "workspace rejected the system prompt settings");
                }
                Some(configured)
            }
            Ok(Err(e)) => {
                warn!(slug, error = %e, "workspace configuration failed");
                None
            }
            Err(_) => {
                warn!(slug, "workspace configuration timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::events::NullPublisher;
    use crate::ai::testing::MockRagBackend;
    use std::time::Duration;

    fn workspaces(names: &[&str]) -> Vec<Workspace> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Workspace {
                name: name.to_string(),
                slug: format!("ws-{}", i),
            })
            .collect()
    }

    fn resolver(backend: Arc<MockRagBackend>) -> WorkspaceResolver {
        WorkspaceResolver::new(backend, WorkspaceConfig::default(), Arc::new(NullPublisher))
    }

    #[test]
    fn test_match_order() {
        let marker = " Parse: ";
        let list = workspaces(&["decagon", "Word Parse: Decagon", "Decagon"]);
        assert_eq!(
            find_matching_workspace(&list, "Decagon", marker).unwrap().slug,
            "ws-2"
        );

        let list = workspaces(&["decagon-v2", "Word Parse: Decagon"]);
        assert_eq!(
            find_matching_workspace(&list, "Decagon", marker).unwrap().slug,
            "ws-1"
        );

        let list = workspaces(&["Flight Control Unit!", "other"]);
        assert_eq!(
            find_matching_workspace(&list, "flight-control unit", marker)
                .unwrap()
                .slug,
            "ws-0"
        );

        let list = workspaces(&["other", "JAMA Parse: Pump Controller Rev B"]);
        assert_eq!(
            find_matching_workspace(&list, "Pump Controller", marker)
                .unwrap()
                .slug,
            "ws-1"
        );

        assert!(find_matching_workspace(&list, "Telemetry", marker).is_none());
        assert!(find_matching_workspace(&list, "  ", marker).is_none());
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Flight-Control  Unit 2"), "flightcontrolunit2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_cached_within_cooldown() {
        let backend = Arc::new(MockRagBackend::with_workspaces(&["Decagon"]));
        let resolver = resolver(Arc::clone(&backend));
        let cancel = CancellationToken::new();

        let first = resolver.ensure_workspace("Decagon", &cancel).await;
        assert_eq!(first.as_deref(), Some("decagon"));
        assert_eq!(MockRagBackend::count(&backend.list_calls), 1);
        assert_eq!(MockRagBackend::count(&backend.configure_calls), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..3 {
            assert_eq!(
                resolver.ensure_workspace("Decagon", &cancel).await,
                first
            );
        }
        assert_eq!(MockRagBackend::count(&backend.list_calls), 1);
        assert_eq!(MockRagBackend::count(&backend.configure_calls), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_revalidation_after_cooldown() {
        let backend = Arc::new(MockRagBackend::with_workspaces(&["Decagon"]));
        let resolver = resolver(Arc::clone(&backend));
        let cancel = CancellationToken::new();

        resolver.ensure_workspace("Decagon", &cancel).await;
        tokio::time::advance(Duration::from_secs(301)).await;

        for _ in 0..3 {
            assert_eq!(
                resolver.ensure_workspace("Decagon", &cancel).await.as_deref(),
                Some("decagon")
            );
        }
        assert_eq!(MockRagBackend::count(&backend.list_calls), 1);
        assert_eq!(MockRagBackend::count(&backend.configure_calls), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_create_once() {
        let backend = Arc::new(MockRagBackend {
            list_delay: Some(Duration::from_millis(50)),
            ..MockRagBackend::default()
        });
        let resolver = Arc::new(resolver(Arc::clone(&backend)));
        let cancel = CancellationToken::new();

        let calls = (0..4).map(|_| {
            let resolver = Arc::clone(&resolver);
            let cancel = cancel.clone();
            async move { resolver.ensure_workspace("New Project", &cancel).await }
        });
        let slugs = futures_util::future::join_all(calls).await;

        assert!(slugs.iter().all(|s| s.as_deref() == Some("new-project")));
        assert_eq!(MockRagBackend::count(&backend.create_calls), 1);
        assert!(resolver.binding().unwrap().system_prompt_configured);
    }

    #[tokio::test]
    async fn test_configuration_failure_is_not_fatal() {
        let backend = Arc::new(MockRagBackend {
            reject_configure: true,
            ..MockRagBackend::default()
        });
        let resolver = resolver(Arc::clone(&backend));
        let binding = resolver
            .ensure_binding("Fresh", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(binding.slug, "fresh");
        assert!(!binding.system_prompt_configured);
    }

    #[tokio::test]
    async fn test_creation_failure_yields_none() {
        let backend = Arc::new(MockRagBackend {
            fail_create: true,
            ..MockRagBackend::default()
        });
        let resolver = resolver(backend);
        assert!(resolver
            .ensure_workspace("Fresh", &CancellationToken::new())
            .await
            .is_none());
        assert!(resolver.binding().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_timeout() {
        let backend = Arc::new(MockRagBackend {
            list_delay: Some(Duration::from_secs(120)),
            ..MockRagBackend::default()
        });
        let resolver = resolver(backend);
        assert!(resolver
            .ensure_workspace("Slow", &CancellationToken::new())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_context_switch_drops_binding() {
        let backend = Arc::new(MockRagBackend::with_workspaces(&["Alpha", "Beta"]));
        let resolver = resolver(Arc::clone(&backend));
        let cancel = CancellationToken::new();

        resolver.set_context("Alpha");
        resolver.ensure_workspace("Alpha", &cancel).await;
        assert!(resolver.binding().is_some());

        resolver.set_context("Alpha");
        assert!(resolver.binding().is_some());

        resolver.set_context("Beta");
        assert!(resolver.binding().is_none());
        assert_eq!(resolver.context().as_deref(), Some("Beta"));

        resolver.ensure_workspace("Beta", &cancel).await;
        resolver.invalidate();
        assert!(resolver.binding().is_none());
    }
}
