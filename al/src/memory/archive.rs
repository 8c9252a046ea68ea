//! Archive - cold working memory
//!
//! Full, untruncated tool outputs indexed by file path and tool name.
//! Conversation context only ever sees truncated output; `archive_recall`
//! reads back from here. Eviction is FIFO by `(iteration, timestamp)` and
//! bounded by entry count and total characters.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ArchiveConfig;

/// One archived tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub id: u64,
    pub iteration: u32,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    pub full_output: String,
    pub output_length: usize,
    pub est_tokens: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_facts: Vec<String>,
}

/// Result of storing one entry.
#[derive(Debug, Clone, Copy)]
pub struct StoreOutcome {
    pub id: u64,
    pub evicted: usize,
}

/// Persisted form: data only, limits come from config at load time.
#[derive(Serialize, Deserialize)]
struct PersistedArchive {
    entries: Vec<ArchiveEntry>,
    next_id: u64,
}

/// The cold memory tier.
#[derive(Debug)]
pub struct Archive {
    entries: Vec<ArchiveEntry>,
    by_file: HashMap<String, Vec<u64>>,
    by_tool: HashMap<String, Vec<u64>>,
    total_chars: usize,
    next_id: u64,
    max_entries: usize,
    max_total_chars: usize,
}

impl Archive {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            entries: Vec::new(),
            by_file: HashMap::new(),
            by_tool: HashMap::new(),
            total_chars: 0,
            next_id: 1,
            max_entries: config.max_entries,
            max_total_chars: config.max_total_chars,
        }
    }

    /// Store one tool execution. Returns the entry id and how many older
    /// entries were evicted to stay within limits.
    pub fn store(
        &mut self,
        iteration: u32,
        tool_name: impl Into<String>,
        tool_input: serde_json::Value,
        full_output: impl Into<String>,
        file_path: Option<String>,
        key_facts: Vec<String>,
    ) -> StoreOutcome {
        let full_output = full_output.into();
        let tool_name = tool_name.into();
        let id = self.next_id;
        self.next_id += 1;

        let entry = ArchiveEntry {
            id,
            iteration,
            tool_name: tool_name.clone(),
            tool_input,
            output_length: full_output.len(),
            est_tokens: full_output.len() / 4,
            timestamp: Utc::now(),
            file_path: file_path.clone(),
            key_facts,
            full_output,
        };

        self.total_chars += entry.output_length;
        if let Some(path) = &entry.file_path {
            self.by_file.entry(path.clone()).or_default().push(id);
        }
        self.by_tool.entry(tool_name).or_default().push(id);
        self.entries.push(entry);

        let evicted = self.evict_to_limits();
        debug!(id, evicted, total_chars = self.total_chars, "Archive::store");
        StoreOutcome { id, evicted }
    }

    /// Evict FIFO by `(iteration, timestamp)` until both limits hold.
    fn evict_to_limits(&mut self) -> usize {
        let mut evicted = 0;
        while self.over_limits() && !self.entries.is_empty() {
            let before = (self.entries.len(), self.total_chars);

            let victim = self
                .entries
                .iter()
                .min_by(|a, b| {
                    a.iteration
                        .cmp(&b.iteration)
                        .then(a.timestamp.cmp(&b.timestamp))
                        .then(a.id.cmp(&b.id))
                })
                .map(|e| e.id);
            if let Some(id) = victim {
                self.remove(id);
                evicted += 1;
            }

            // Size-stalled guard: an eviction round that frees nothing would
            // spin forever against the char limit.
            if (self.entries.len(), self.total_chars) == before {
                warn!("Archive::evict_to_limits: eviction stalled");
                break;
            }
        }
        evicted
    }

    fn over_limits(&self) -> bool {
        self.entries.len() > self.max_entries || self.total_chars > self.max_total_chars
    }

    fn remove(&mut self, id: u64) {
        if let Some(pos) = self.entries.iter().position(|e| e.id == id) {
            let entry = self.entries.remove(pos);
            self.total_chars -= entry.output_length;
            if let Some(path) = &entry.file_path
                && let Some(ids) = self.by_file.get_mut(path)
            {
                ids.retain(|&i| i != id);
                if ids.is_empty() {
                    self.by_file.remove(path);
                }
            }
            if let Some(ids) = self.by_tool.get_mut(&entry.tool_name) {
                ids.retain(|&i| i != id);
                if ids.is_empty() {
                    self.by_tool.remove(&entry.tool_name);
                }
            }
        }
    }

    fn get(&self, id: u64) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Most recent entry touching `path`.
    pub fn recall_by_file_path(&self, path: &str) -> Option<&ArchiveEntry> {
        self.by_file.get(path)?.last().and_then(|&id| self.get(id))
    }

    /// All entries touching `path`, chronological.
    pub fn recall_all_by_file_path(&self, path: &str) -> Vec<&ArchiveEntry> {
        self.by_file
            .get(path)
            .map(|ids| ids.iter().filter_map(|&id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Most recent `limit` entries from `tool_name`, chronological.
    pub fn recall_by_tool_name(&self, tool_name: &str, limit: usize) -> Vec<&ArchiveEntry> {
        let Some(ids) = self.by_tool.get(tool_name) else {
            return Vec::new();
        };
        let start = ids.len().saturating_sub(limit);
        ids[start..].iter().filter_map(|&id| self.get(id)).collect()
    }

    /// Entries stored during `iteration`.
    pub fn recall_by_iteration(&self, iteration: u32) -> Vec<&ArchiveEntry> {
        self.entries.iter().filter(|e| e.iteration == iteration).collect()
    }

    /// Case-insensitive keyword search over outputs and key facts.
    pub fn search(&self, keyword: &str, limit: usize) -> Vec<&ArchiveEntry> {
        let needle = keyword.to_lowercase();
        self.entries
            .iter()
            .filter(|e| {
                e.full_output.to_lowercase().contains(&needle)
                    || e.key_facts.iter().any(|f| f.to_lowercase().contains(&needle))
            })
            .take(limit)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Short hint for the system prompt.
    pub fn summary(&self) -> String {
        format!(
            "{} archived outputs, {} chars, {} files indexed",
            self.entries.len(),
            self.total_chars,
            self.by_file.len()
        )
    }

    /// Write the archive to a JSON file.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let persisted = PersistedArchive {
            entries: self.entries.clone(),
            next_id: self.next_id,
        };
        let text = serde_json::to_string(&persisted)?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), text).context("Failed to write archive")?;
        Ok(())
    }

    /// Load an archive written by [`persist`](Self::persist). Indexes are
    /// rebuilt; limits come from `config`.
    pub fn load(path: impl AsRef<Path>, config: &ArchiveConfig) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).context("Failed to read archive")?;
        let persisted: PersistedArchive = serde_json::from_str(&text)?;

        let mut archive = Self::new(config);
        archive.next_id = persisted.next_id;
        for entry in persisted.entries {
            archive.total_chars += entry.output_length;
            if let Some(p) = &entry.file_path {
                archive.by_file.entry(p.clone()).or_default().push(entry.id);
            }
            archive.by_tool.entry(entry.tool_name.clone()).or_default().push(entry.id);
            archive.entries.push(entry);
        }
        Ok(archive)
    }
}
