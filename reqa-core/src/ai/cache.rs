//! Analysis Cache
//!
//! Content-addressed store of successful analyses. The key is a SHA-256
//! fingerprint of the requirement's normalized content (description, tables,
//! loose content and selected assumptions), so two requirements with the same
//! content share an entry regardless of their identifiers.

use crate::config::CacheConfig;
use crate::models::{Analysis, Requirement, RequirementTable};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::debug;

/// Compute the content fingerprint of a requirement
pub fn fingerprint(req: &Requirement) -> String {
    let mut hasher = Sha256::new();

    hasher.update(b"description\0");
    hasher.update(normalize(&req.description).as_bytes());

    for table in &req.tables {
        hash_table(&mut hasher, b"table\0", table);
    }

    if let Some(loose) = &req.loose_content {
        for paragraph in &loose.paragraphs {
            hasher.update(b"paragraph\0");
            hasher.update(normalize(paragraph).as_bytes());
        }
        for table in &loose.tables {
            hash_table(&mut hasher, b"loose-table\0", table);
        }
    }

    let mut assumptions: Vec<String> = req
        .selected_assumptions
        .iter()
        .map(|a| normalize(a))
        .filter(|a| !a.is_empty())
        .collect();
    assumptions.sort();
    assumptions.dedup();
    for assumption in assumptions {
        hasher.update(b"assumption\0");
        hasher.update(assumption.as_bytes());
    }

    format!("{:x}", hasher.finalize())
}

fn hash_table(hasher: &mut Sha256, tag: &[u8], table: &RequirementTable) {
    hasher.update(tag);
    hasher.update(normalize(&table.title).as_bytes());
    for header in &table.headers {
        hasher.update(b"\x1f");
        hasher.update(normalize(header).as_bytes());
    }
    for row in &table.rows {
        hasher.update(b"\x1e");
        for cell in row {
            hasher.update(b"\x1f");
            hasher.update(normalize(cell).as_bytes());
        }
    }
}

/// Trim and collapse runs of whitespace
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A cached analysis with its staleness metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub requirement_id: String,
    pub analysis: Analysis,
    pub stored_at: DateTime<Utc>,
}

/// Counters reported by [`AnalysisCache::statistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub hit_count: u64,
    pub miss_count: u64,
    pub total_entries: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// requirement id -> fingerprint it was last stored under or served from
    by_requirement: HashMap<String, String>,
}

/// Thread-safe analysis cache shared by concurrent analyses
pub struct AnalysisCache {
    state: RwLock<CacheState>,
    max_age: Option<Duration>,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for AnalysisCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl AnalysisCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            max_age: config
                .max_age_secs
                .map(|secs| Duration::seconds(secs.min(i64::MAX as u64 / 1000) as i64)),
            enabled: config.enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a prior analysis for content identical to `req`
    pub fn try_get(&self, req: &Requirement) -> Option<Analysis> {
        if !self.enabled {
            return None;
        }

        let key = fingerprint(req);
        let lookup = {
            let state = self.state.read().ok()?;
            state.entries.get(&key).map(|entry| {
                let stale = self.is_stale(entry);
                (entry.analysis.clone(), stale)
            })
        };

        match lookup {
            Some((analysis, false)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(requirement_id = %req.id, "analysis cache hit");
                // remember which entry served this id so invalidate() can find it
                if let Ok(mut state) = self.state.write() {
                    state.by_requirement.insert(req.id.clone(), key);
                }
                Some(analysis)
            }
            Some((_, true)) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(requirement_id = %req.id, "analysis cache entry is stale, evicting");
                if let Ok(mut state) = self.state.write() {
                    state.entries.remove(&key);
                }
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a successful analysis. Failed analyses are never cached.
    /// Storing new content for a known requirement evicts its old entry.
    pub fn store(&self, req: &Requirement, analysis: &Analysis) {
        if !self.enabled || !analysis.is_analyzed {
            return;
        }

        let key = fingerprint(req);
        let Ok(mut state) = self.state.write() else {
            return;
        };

        if let Some(previous) = state.by_requirement.insert(req.id.clone(), key.clone()) {
            if previous != key {
                debug!(requirement_id = %req.id, "requirement content changed, evicting old analysis");
                let still_referenced = state.by_requirement.values().any(|fp| fp == &previous);
                if !still_referenced {
                    state.entries.remove(&previous);
                }
            }
        }

        state.entries.insert(
            key.clone(),
            CacheEntry {
                fingerprint: key,
                requirement_id: req.id.clone(),
                analysis: analysis.clone(),
                stored_at: Utc::now(),
            },
        );
    }

    /// Drop whatever was cached for this requirement id
    pub fn invalidate(&self, requirement_id: &str) {
        if let Ok(mut state) = self.state.write() {
            if let Some(key) = state.by_requirement.remove(requirement_id) {
                state.entries.remove(&key);
                state.by_requirement.retain(|_, fp| fp != &key);
            }
            state.entries.retain(|_, e| e.requirement_id != requirement_id);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.write() {
            state.entries.clear();
            state.by_requirement.clear();
        }
    }

    pub fn statistics(&self) -> CacheStatistics {
        let total_entries = self.state.read().map(|s| s.entries.len()).unwrap_or(0);
        CacheStatistics {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            total_entries,
        }
    }

    fn is_stale(&self, entry: &CacheEntry) -> bool {
        match self.max_age {
            Some(max_age) => Utc::now() - entry.stored_at > max_age,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisErrorKind, LooseContent};
    use std::sync::Arc;

    fn req(id: &str, description: &str) -> Requirement {
        Requirement::new(id, "name", description)
    }

    #[test]
    fn test_fingerprint_ignores_identity_and_whitespace() {
        let a = req("REQ-1", "The pump shall  stop\n within 2 s");
        let mut b = req("REQ-2", "The pump shall stop within 2 s ");
        b.name = "different name".to_string();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_covers_tables_loose_content_and_assumptions() {
        let base = req("REQ-1", "The pump shall stop");
        let base_fp = fingerprint(&base);

        let mut with_table = base.clone();
        with_table.tables.push(RequirementTable {
            title: "Limits".to_string(),
            headers: vec!["A".to_string()],
            rows: vec![vec!["1".to_string()]],
        });
        assert_ne!(fingerprint(&with_table), base_fp);

        let mut with_loose = base.clone();
        with_loose.loose_content = Some(LooseContent {
            paragraphs: vec!["note".to_string()],
            tables: Vec::new(),
        });
        assert_ne!(fingerprint(&with_loose), base_fp);

        let mut with_assumption = base.clone();
        with_assumption.selected_assumptions.push("bench".to_string());
        assert_ne!(fingerprint(&with_assumption), base_fp);
    }

    #[test]
    fn test_store_and_hit() {
        let cache = AnalysisCache::default();
        let r = req("REQ-1", "The pump shall stop");
        assert!(cache.try_get(&r).is_none());

        let analysis = Analysis::analyzed(7);
        cache.store(&r, &analysis);
        assert_eq!(cache.try_get(&r), Some(analysis.clone()));

        // structurally identical requirement shares the entry
        let twin = req("REQ-9", "The pump shall stop");
        assert_eq!(cache.try_get(&twin), Some(analysis));

        let stats = cache.statistics();
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.total_entries, 1);
    }

    #[test]
    fn test_failed_analysis_not_cached() {
        let cache = AnalysisCache::default();
        let r = req("REQ-1", "text");
        cache.store(&r, &Analysis::failed(AnalysisErrorKind::Timeout, "slow"));
        assert!(cache.try_get(&r).is_none());
        assert_eq!(cache.statistics().total_entries, 0);
    }

    #[test]
    fn test_content_change_evicts_old_entry() {
        let cache = AnalysisCache::default();
        let mut r = req("REQ-1", "old text");
        cache.store(&r, &Analysis::analyzed(4));
        r.description = "new text".to_string();
        cache.store(&r, &Analysis::analyzed(8));

        assert_eq!(cache.statistics().total_entries, 1);
        assert!(cache.try_get(&req("REQ-1", "old text")).is_none());
        assert_eq!(cache.try_get(&r).unwrap().original_quality_score, 8);
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = AnalysisCache::default();
        let a = req("REQ-1", "alpha");
        let b = req("REQ-2", "beta");
        cache.store(&a, &Analysis::analyzed(5));
        cache.store(&b, &Analysis::analyzed(6));

        cache.invalidate("REQ-1");
        assert!(cache.try_get(&a).is_none());
        assert!(cache.try_get(&b).is_some());

        cache.clear();
        assert_eq!(cache.statistics().total_entries, 0);
    }

    #[test]
    fn test_invalidate_requirement_served_from_twin_entry() {
        let cache = AnalysisCache::default();
        let original = req("REQ-1", "The device shall power on");
        let twin = req("REQ-9", "The device shall power on");
        cache.store(&original, &Analysis::analyzed(7));
        assert!(cache.try_get(&twin).is_some());

        cache.invalidate("REQ-9");
        assert!(cache.try_get(&twin).is_none());
        assert!(cache.try_get(&original).is_none());
        assert_eq!(cache.statistics().total_entries, 0);
    }

    #[test]
    fn test_stale_entries_are_evicted() {
        let cache = AnalysisCache::new(&CacheConfig {
            enabled: true,
            max_age_secs: Some(0),
        });
        let r = req("REQ-1", "alpha");
        let mut analysis = Analysis::analyzed(5);
        analysis.timestamp = Utc::now();
        cache.store(&r, &analysis);
        if let Ok(mut state) = cache.state.write() {
            for entry in state.entries.values_mut() {
                entry.stored_at = Utc::now() - Duration::seconds(5);
            }
        }
        assert!(cache.try_get(&r).is_none());
        assert_eq!(cache.statistics().total_entries, 0);
    }

    #[test]
    fn test_disabled_cache() {
        let cache = AnalysisCache::new(&CacheConfig {
            enabled: false,
            max_age_secs: None,
        });
        let r = req("REQ-1", "alpha");
        cache.store(&r, &Analysis::analyzed(5));
        assert!(cache.try_get(&r).is_none());
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(AnalysisCache::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let r = req(&format!("REQ-{}", i), &format!("text {}", i % 4));
                    cache.store(&r, &Analysis::analyzed(5));
                    assert!(cache.try_get(&r).is_some());
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.statistics().total_entries, 4);
    }
}
