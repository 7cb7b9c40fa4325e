mod cli;
mod prompts;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reqa_core::ai::derivation::{BatchProgress, BatchProgressCallback, WorkflowSeverity};
use reqa_core::ai::{BroadcastPublisher, HealthMonitor, ServiceStatus};
use reqa_core::{
    Analysis, AnalysisEngine, AnythingLlmClient, ChatCompletionsClient, EngineConfig,
    EngineEvent, Requirement, Storage,
};

use crate::cli::{Cli, Command};
use crate::prompts::{InteractiveDecider, PromptFileDelegate};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = EngineConfig::load_or_default(cli.config.as_deref())?;
    let storage = Storage::new(&cli.file);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    match &cli.command {
        Command::Analyze {
            id,
            workspace,
            no_rag,
            json,
            no_save,
        } => {
            analyze(
                &storage,
                config,
                id,
                workspace.as_deref(),
                !*no_rag,
                *json,
                !*no_save,
                &cancel,
            )
            .await?;
        }
        Command::Prompt { id } => {
            print_prompt(&storage, config, id)?;
        }
        Command::Derive { concurrency } => {
            derive(&storage, config, *concurrency, &cancel).await?;
        }
        Command::Validate => {
            validate(&storage, config, &cancel).await?;
        }
        Command::Health => {
            health(&config, &cancel).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_engine(
    mut config: EngineConfig,
    use_rag: bool,
    events: Option<Arc<BroadcastPublisher>>,
) -> Result<AnalysisEngine> {
    config.pipeline.use_rag = config.pipeline.use_rag && use_rag;
    let generator = Arc::new(
        ChatCompletionsClient::new(&config.backend).context("Failed to set up the model client")?,
    );

    let mut builder = AnalysisEngine::builder(config.clone(), generator)
        .timeout_decider(Arc::new(InteractiveDecider))
        .external_delegate(Arc::new(PromptFileDelegate::new(".")));
    if config.pipeline.use_rag {
        let rag = Arc::new(
            AnythingLlmClient::new(&config.backend).context("Failed to set up the RAG client")?,
        );
        builder = builder.rag_backend(rag.clone()).health_monitor(rag);
    }
    if let Some(events) = events {
        builder = builder.event_publisher(events);
    }
    Ok(builder.build())
}

/// Surfaces engine notices the user should see while analyses run
fn watch_events(events: &BroadcastPublisher) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(EngineEvent::DegradedMode {
                    requirement_id,
                    reason,
                }) => eprintln!(
                    "{} {}: {}",
                    "RAG unavailable, using direct model for".yellow(),
                    requirement_id,
                    reason
                ),
                Ok(EngineEvent::FabricationFlagged {
                    requirement_id,
                    kind,
                }) => eprintln!(
                    "{} {} ({:?})",
                    "Possible fabricated details in analysis of".yellow(),
                    requirement_id,
                    kind
                ),
                Ok(EngineEvent::WorkspaceResolved { slug, created, .. }) if created => {
                    eprintln!("{} {}", "Created workspace".cyan(), slug)
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn select_requirements<'a>(all: &'a [Requirement], ids: &[String]) -> Result<Vec<&'a Requirement>> {
    if ids.is_empty() {
        return Ok(all.iter().collect());
    }
    ids.iter()
        .map(|id| {
            all.iter()
                .find(|r| &r.id == id)
                .with_context(|| format!("Requirement not found: {}", id))
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn analyze(
    storage: &Storage,
    config: EngineConfig,
    ids: &[String],
    workspace: Option<&str>,
    use_rag: bool,
    json: bool,
    save: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let set = storage.load()?;
    let selected = select_requirements(&set.requirements, ids)?;
    if selected.is_empty() {
        bail!("No requirements in {}", storage.path().display());
    }

    let events = Arc::new(BroadcastPublisher::default());
    watch_events(&events);
    let engine = build_engine(config, use_rag, Some(events))?;

    let context = workspace.unwrap_or(&set.project);
    if !context.is_empty() {
        engine.set_workspace_context(context);
    }

    let on_partial = |_chunk: &str| {};
    let on_progress = move |message: &str| {
        if !json {
            eprintln!("  {}", message.dimmed());
        }
    };

    let mut results: Vec<(String, Analysis)> = Vec::new();
    for req in selected {
        if cancel.is_cancelled() {
            break;
        }
        if !json {
            eprintln!("{} {} {}", "Analyzing".cyan(), req.id.bold(), req.name);
        }
        let analysis = engine
            .analyze_requirement_with_streaming(req, &on_partial, &on_progress, cancel)
            .await;
        if !json {
            print_analysis(req, &analysis);
        }
        results.push((req.id.clone(), analysis));
    }

    if json {
        let out: Vec<serde_json::Value> = results
            .iter()
            .map(|(id, analysis)| serde_json::json!({ "requirementId": id, "analysis": analysis }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    }

    let stats = engine.cache_statistics();
    info!(
        hits = stats.hit_count,
        misses = stats.miss_count,
        entries = stats.total_entries,
        "analysis run finished"
    );

    let to_store: Vec<&(String, Analysis)> =
        results.iter().filter(|(_, a)| !a.is_cancelled()).collect();
    if save && !to_store.is_empty() {
        storage.update_atomically(|set| {
            for (id, analysis) in &to_store {
                if let Some(req) = set.get_mut(id) {
                    req.apply_analysis(analysis.clone());
                }
            }
        })?;
        if !json {
            println!(
                "{} {}",
                format!("Saved {} analyses to", to_store.len()).green(),
                storage.path().display()
            );
        }
    }

    Ok(())
}

fn print_analysis(req: &Requirement, analysis: &Analysis) {
    println!("\n{} {}", req.id.bold(), req.name);
    if !analysis.is_analyzed {
        let kind = analysis
            .error_kind
            .map(|k| format!("{:?}", k))
            .unwrap_or_else(|| "Error".to_string());
        println!(
            "  {} {}",
            format!("{}:", kind).red(),
            analysis.error_message.as_deref().unwrap_or("")
        );
        return;
    }

    let score = analysis.original_quality_score;
    let score_text = format!("{}/10", score);
    let score_text = if score >= 8 {
        score_text.green()
    } else if score >= 5 {
        score_text.yellow()
    } else {
        score_text.red()
    };
    match analysis.mode {
        Some(mode) => println!("  Score: {} ({:?})", score_text, mode),
        None => println!("  Score: {}", score_text),
    }

    if let Some(warning) = &analysis.quality_warning {
        println!("  {} {}", "Warning:".yellow(), warning);
    }

    if !analysis.issues.is_empty() {
        println!("  {}:", "Issues".green());
        for issue in &analysis.issues {
            println!(
                "    - [{}/{}] {}",
                issue.category, issue.severity, issue.description
            );
        }
    }

    if !analysis.recommendations.is_empty() {
        println!("  {}:", "Recommendations".green());
        for rec in &analysis.recommendations {
            println!("    - [{}] {}", rec.category, rec.description);
            if !rec.suggested_edit.is_empty() {
                println!("      {} {}", "Suggested:".cyan(), rec.suggested_edit);
            }
        }
    }

    if !analysis.freeform_feedback.is_empty() {
        println!("  {}: {}", "Feedback".green(), analysis.freeform_feedback);
    }
}

fn print_prompt(storage: &Storage, config: EngineConfig, id: &str) -> Result<()> {
    let set = storage.load()?;
    let req = set
        .get(id)
        .with_context(|| format!("Requirement not found: {}", id))?;
    let generator = Arc::new(ChatCompletionsClient::new(&config.backend)?);
    let engine = AnalysisEngine::builder(config, generator).build();
    println!("{}", engine.export_prompt_for_external_use(req));
    Ok(())
}

async fn derive(
    storage: &Storage,
    config: EngineConfig,
    concurrency: Option<usize>,
    cancel: &CancellationToken,
) -> Result<()> {
    let set = storage.load()?;
    let concurrency = concurrency.unwrap_or(config.derivation.max_concurrency);
    let engine = build_engine(config, false, None)?;

    let progress: BatchProgressCallback<'_> = &|p: &BatchProgress| {
        eprintln!(
            "  {} {}/{} {}",
            "derived".dimmed(),
            p.completed,
            p.total,
            p.requirement_id
        );
    };
    let results = engine
        .analyze_batch_derivation(&set.requirements, concurrency, Some(progress), cancel)
        .await?;

    for result in &results {
        let marker = if result.is_failed() {
            "failed".red()
        } else if result.has_testable_content {
            "testable".green()
        } else {
            "not testable".yellow()
        };
        println!(
            "\n{} [{}] confidence {:.2}",
            result.requirement_id.bold(),
            marker,
            result.confidence
        );
        for cap in &result.derived_capabilities {
            println!("  - {} {} ({:.2})", cap.id, cap.description, cap.confidence);
        }
        for issue in &result.issues {
            println!("  {} {}", "!".yellow(), issue);
        }
    }

    let capabilities: Vec<_> = results
        .iter()
        .flat_map(|r| r.derived_capabilities.iter().cloned())
        .collect();
    let gap = engine
        .analyze_gap(&capabilities, &set.requirements, cancel)
        .await;

    if gap.uncovered_capabilities.is_empty() {
        println!("\n{}", "All derived capabilities are covered.".green());
    } else {
        println!("\n{}:", "Uncovered capabilities".red());
        for uncovered in &gap.uncovered_capabilities {
            println!(
                "  - [{:?}] {} {}",
                uncovered.severity, uncovered.capability.id, uncovered.recommendation
            );
        }
    }
    for overlap in &gap.overlaps {
        println!(
            "  {} {} covered by {}",
            "overlap:".cyan(),
            overlap.requirement_id,
            overlap.capability_ids.join(", ")
        );
    }

    Ok(())
}

async fn validate(storage: &Storage, config: EngineConfig, cancel: &CancellationToken) -> Result<()> {
    let set = storage.load()?;
    let engine = build_engine(config, false, None)?;
    let validation = engine
        .validate_testing_workflow(&set.requirements, cancel)
        .await?;

    let verdict = if validation.is_valid {
        "valid".green()
    } else {
        "invalid".red()
    };
    println!(
        "Testing workflow {} (coverage {:.1}%, score {:.2})",
        verdict, validation.coverage_percentage, validation.overall_score
    );

    for issue in &validation.issues {
        let label = format!("{:?}", issue.severity);
        let label = match issue.severity {
            WorkflowSeverity::Critical | WorkflowSeverity::Error => label.red(),
            WorkflowSeverity::Warning => label.yellow(),
            WorkflowSeverity::Info => label.normal(),
        };
        println!("  [{}] {}: {}", label, issue.category, issue.message);
    }
    if !validation.recommendations.is_empty() {
        println!("{}:", "Recommendations".green());
        for rec in &validation.recommendations {
            println!("  - {}", rec);
        }
    }

    Ok(())
}

async fn health(config: &EngineConfig, cancel: &CancellationToken) -> Result<()> {
    let client = AnythingLlmClient::new(&config.backend)?;
    let status = client.check_health(cancel).await?;
    let label = match status.status {
        ServiceStatus::Healthy => "healthy".green(),
        ServiceStatus::Degraded => "degraded".yellow(),
        ServiceStatus::Unavailable => "unavailable".red(),
    };
    println!("RAG server {}: {}", config.backend.rag_url, label);
    if status.is_using_fallback {
        println!("  {}", "serving through a fallback model".yellow());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_requirements() {
        let all = vec![
            Requirement::new("REQ-1", "a", "The pump shall stop."),
            Requirement::new("REQ-2", "b", "The valve shall open."),
        ];
        assert_eq!(select_requirements(&all, &[]).unwrap().len(), 2);

        let picked = select_requirements(&all, &["REQ-2".to_string()]).unwrap();
        assert_eq!(picked[0].id, "REQ-2");

        assert!(select_requirements(&all, &["REQ-9".to_string()]).is_err());
    }
}
