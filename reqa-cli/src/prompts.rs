use async_trait::async_trait;
use colored::Colorize;
use inquire::Confirm;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use reqa_core::ai::ExternalDelegate;
use reqa_core::{TimeoutDecider, TimeoutDecision};

/// Asks on the terminal whether to keep waiting for a slow analysis
pub struct InteractiveDecider;

fn ask_keep_waiting(requirement_id: &str, waited: Duration, window: u32) -> TimeoutDecision {
    let question = format!(
        "Analysis of {} still running after {}s (window {}). Keep waiting?",
        requirement_id,
        waited.as_secs(),
        window
    );
    // A closed terminal counts as "no"
    let keep_waiting = Confirm::new(&question)
        .with_default(true)
        .prompt()
        .unwrap_or(false);
    if keep_waiting {
        return TimeoutDecision::KeepWaiting;
    }

    let export_prompt = Confirm::new("Write the prompt to a file for an external model?")
        .with_default(false)
        .prompt()
        .unwrap_or(false);
    TimeoutDecision::Abort { export_prompt }
}

#[async_trait]
impl TimeoutDecider for InteractiveDecider {
    async fn decide(&self, requirement_id: &str, waited: Duration, window: u32) -> TimeoutDecision {
        let id = requirement_id.to_string();
        match tokio::task::spawn_blocking(move || ask_keep_waiting(&id, waited, window)).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(requirement_id, error = %e, "timeout prompt failed, aborting");
                TimeoutDecision::Abort {
                    export_prompt: false,
                }
            }
        }
    }
}

/// Writes exported prompts to `<dir>/<requirement id>.prompt.md`
pub struct PromptFileDelegate {
    dir: PathBuf,
}

impl PromptFileDelegate {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, requirement_id: &str) -> PathBuf {
        let name: String = requirement_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.prompt.md", name))
    }
}

impl ExternalDelegate for PromptFileDelegate {
    fn deliver_prompt(&self, requirement_id: &str, prompt: &str) {
        let path = self.file_for(requirement_id);
        match fs::write(&path, prompt) {
            Ok(()) => eprintln!(
                "{} {}",
                "Prompt written to".cyan(),
                path.display().to_string().bold()
            ),
            Err(e) => warn!(requirement_id, path = ?path, error = %e, "could not write prompt file"),
        }
    }
}
