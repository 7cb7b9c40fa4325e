//! Reference document sync
//!
//! Configured reference documents are pushed into a workspace so retrieval
//! can draw on them. A small JSON file per workspace slug records when that
//! last succeeded; documents are re-sent once it is older than the sync
//! interval.

use crate::ai::client::RagBackend;
use crate::config::ReferenceDocument;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRecord {
    pub slug: String,
    pub last_sync: DateTime<Utc>,
    pub documents: Vec<String>,
}

/// Per-slug sync timestamps stored as JSON files in one directory
#[derive(Debug, Clone)]
pub struct SyncTracker {
    dir: PathBuf,
    interval: Duration,
}

impl SyncTracker {
    pub fn new(dir: impl Into<PathBuf>, interval: std::time::Duration) -> Self {
        let interval = Duration::from_std(interval).unwrap_or_else(|_| Duration::days(1));
        Self {
            dir: dir.into(),
            interval,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, slug: &str) -> PathBuf {
        let file: String = slug
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }

    pub fn last_sync(&self, slug: &str) -> Option<DateTime<Utc>> {
        let path = self.record_path(slug);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<SyncRecord>(&content) {
            Ok(record) => Some(record.last_sync),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable sync record");
                None
            }
        }
    }

    pub fn needs_sync(&self, slug: &str) -> bool {
        match self.last_sync(slug) {
            Some(last) => Utc::now() - last >= self.interval,
            None => true,
        }
    }

    pub fn record_sync(&self, slug: &str, documents: &[String]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create sync directory {}", self.dir.display()))?;
        let record = SyncRecord {
            slug: slug.to_string(),
            last_sync: Utc::now(),
            documents: documents.to_vec(),
        };
        let path = self.record_path(slug);
        let content = serde_json::to_string_pretty(&record)?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write sync record {}", path.display()))?;
        Ok(())
    }

    /// Upload every document when the slug is due. Returns whether a sync
    /// completed. Errors are logged, never returned.
    pub async fn sync_if_due(
        &self,
        backend: &dyn RagBackend,
        slug: &str,
        documents: &[ReferenceDocument],
    ) -> bool {
        if documents.is_empty() || !self.needs_sync(slug) {
            return false;
        }

        info!(slug, count = documents.len(), "syncing reference documents");
        let mut all_ok = true;
        let mut names = Vec::with_capacity(documents.len());

        for doc in documents {
            let content = match doc.read_content() {
                Ok(content) => content,
                Err(e) => {
                    warn!(document = %doc.name, error = %e, "cannot read reference document");
                    all_ok = false;
                    continue;
                }
            };
            match backend.upload_document(slug, &doc.name, &content).await {
                Ok(true) => {
                    debug!(slug, document = %doc.name, "reference document uploaded");
                    names.push(doc.name.clone());
                }
                Ok(false) => {
                    warn!(slug, document = %doc.name, "reference document rejected");
                    all_ok = false;
                }
                Err(e) => {
                    warn!(slug, document = %doc.name, error = %e, "reference upload failed");
                    all_ok = false;
                }
            }
        }

        if !all_ok {
            return false;
        }
        if let Err(e) = self.record_sync(slug, &names) {
            warn!(slug, error = %e, "could not record sync time");
        }
        true
    }
}
