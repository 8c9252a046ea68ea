//! SessionStore trait and its file-backed / in-memory implementations

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::history::{ConversationRecord, HistoryPolicy, SummarizedHistory, summarize_history};
use crate::kpi::KpiBaseline;

/// One entry in the session event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "ts")]
    pub at: DateTime<Utc>,
    pub kind: String,
    pub payload: serde_json::Value,
}

impl SessionEvent {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            at: Utc::now(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Filter for reading back session events.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events of this kind, when set.
    pub kind: Option<String>,
    /// Most recent N events, when set.
    pub limit: Option<usize>,
}

/// Persistence consumed by the engine. All methods are cheap; callers treat
/// the store as advisory and tolerate empty results for fresh sessions.
pub trait SessionStore: Send + Sync {
    /// Conversation history, progressively summarized into tiers.
    fn conversation_history(&self, session_id: &str) -> Result<SummarizedHistory>;

    /// Append records from a finished run.
    fn append_conversation(&self, session_id: &str, records: &[ConversationRecord]) -> Result<()>;

    /// Free-form context block describing prior trace artifacts, or empty.
    fn trace_artifacts_context(&self, session_id: &str) -> Result<String>;

    /// KPI baseline, if one has been written.
    fn kpi_baseline(&self, session_id: &str) -> Result<Option<KpiBaseline>>;

    /// Read-modify-write on the baseline. Last writer wins across processes.
    fn update_kpi_baseline(
        &self,
        session_id: &str,
        update: &mut dyn FnMut(&mut KpiBaseline),
    ) -> Result<KpiBaseline>;

    /// Append one event to the session log.
    fn append_event(&self, session_id: &str, event: SessionEvent) -> Result<()>;

    /// Read back events, filtered.
    fn session_events(&self, session_id: &str, filter: &EventFilter) -> Result<Vec<SessionEvent>>;
}

fn apply_filter(mut events: Vec<SessionEvent>, filter: &EventFilter) -> Vec<SessionEvent> {
    if let Some(kind) = &filter.kind {
        events.retain(|e| &e.kind == kind);
    }
    if let Some(limit) = filter.limit
        && events.len() > limit
    {
        let skip = events.len() - limit;
        events.drain(..skip);
    }
    events
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionData {
    records: Vec<ConversationRecord>,
    baseline: Option<KpiBaseline>,
    events: Vec<SessionEvent>,
    artifacts: String,
}

/// Process-local store. Also serves as the fallback baseline holder when no
/// session directory is configured.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionData>>,
    policy: HistoryPolicy,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: HistoryPolicy) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// Test/bootstrap helper: seed the artifacts context for a session.
    pub fn set_artifacts(&self, session_id: &str, artifacts: impl Into<String>) {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        sessions.entry(session_id.to_string()).or_default().artifacts = artifacts.into();
    }
}

impl SessionStore for MemorySessionStore {
    fn conversation_history(&self, session_id: &str) -> Result<SummarizedHistory> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        Ok(sessions
            .get(session_id)
            .map(|s| summarize_history(&s.records, &self.policy))
            .unwrap_or_default())
    }

    fn append_conversation(&self, session_id: &str, records: &[ConversationRecord]) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        sessions
            .entry(session_id.to_string())
            .or_default()
            .records
            .extend_from_slice(records);
        Ok(())
    }

    fn trace_artifacts_context(&self, session_id: &str) -> Result<String> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        Ok(sessions.get(session_id).map(|s| s.artifacts.clone()).unwrap_or_default())
    }

    fn kpi_baseline(&self, session_id: &str) -> Result<Option<KpiBaseline>> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        Ok(sessions.get(session_id).and_then(|s| s.baseline.clone()))
    }

    fn update_kpi_baseline(
        &self,
        session_id: &str,
        update: &mut dyn FnMut(&mut KpiBaseline),
    ) -> Result<KpiBaseline> {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        let data = sessions.entry(session_id.to_string()).or_default();
        let mut baseline = data.baseline.clone().unwrap_or_default();
        update(&mut baseline);
        data.baseline = Some(baseline.clone());
        Ok(baseline)
    }

    fn append_event(&self, session_id: &str, event: SessionEvent) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session map poisoned");
        sessions.entry(session_id.to_string()).or_default().events.push(event);
        Ok(())
    }

    fn session_events(&self, session_id: &str, filter: &EventFilter) -> Result<Vec<SessionEvent>> {
        let sessions = self.sessions.lock().expect("session map poisoned");
        let events = sessions.get(session_id).map(|s| s.events.clone()).unwrap_or_default();
        Ok(apply_filter(events, filter))
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// File-backed store rooted at a memory directory (typically `.kb/memory`).
/// One subdirectory per session.
pub struct FileSessionStore {
    base_path: PathBuf,
    policy: HistoryPolicy,
}

impl FileSessionStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).context("Failed to create session store directory")?;
        debug!(?base_path, "Opened session store");
        Ok(Self {
            base_path,
            policy: HistoryPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: HistoryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        let dir = self.base_path.join(session_id);
        fs::create_dir_all(&dir).context("Failed to create session directory")?;
        Ok(dir)
    }

    fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut items = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(item) => items.push(item),
                // A torn trailing line from a crashed writer is not fatal
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unparseable line"),
            }
        }
        Ok(items)
    }

    fn append_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        for item in items {
            let line = serde_json::to_string(item)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn conversation_history(&self, session_id: &str) -> Result<SummarizedHistory> {
        let path = self.session_dir(session_id)?.join("history.jsonl");
        let records: Vec<ConversationRecord> = Self::read_jsonl(&path)?;
        Ok(summarize_history(&records, &self.policy))
    }

    fn append_conversation(&self, session_id: &str, records: &[ConversationRecord]) -> Result<()> {
        let path = self.session_dir(session_id)?.join("history.jsonl");
        Self::append_jsonl(&path, records)
    }

    fn trace_artifacts_context(&self, session_id: &str) -> Result<String> {
        let path = self.session_dir(session_id)?.join("artifacts.md");
        if path.exists() {
            fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
        } else {
            Ok(String::new())
        }
    }

    fn kpi_baseline(&self, session_id: &str) -> Result<Option<KpiBaseline>> {
        let path = self.session_dir(session_id)?.join("baseline.json");
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text).context("Failed to parse baseline")?))
    }

    fn update_kpi_baseline(
        &self,
        session_id: &str,
        update: &mut dyn FnMut(&mut KpiBaseline),
    ) -> Result<KpiBaseline> {
        let dir = self.session_dir(session_id)?;
        let path = dir.join("baseline.json");
        let lock_path = dir.join("baseline.lock");

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.lock_exclusive().context("Failed to lock baseline")?;

        let mut baseline = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?).unwrap_or_default()
        } else {
            KpiBaseline::default()
        };
        update(&mut baseline);

        let tmp = dir.join("baseline.json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&baseline)?)?;
        fs::rename(&tmp, &path)?;

        FileExt::unlock(&lock)?;
        Ok(baseline)
    }

    fn append_event(&self, session_id: &str, event: SessionEvent) -> Result<()> {
        let path = self.session_dir(session_id)?.join("events.jsonl");
        Self::append_jsonl(&path, std::slice::from_ref(&event))
    }

    fn session_events(&self, session_id: &str, filter: &EventFilter) -> Result<Vec<SessionEvent>> {
        let path = self.session_dir(session_id)?.join("events.jsonl");
        let events: Vec<SessionEvent> = Self::read_jsonl(&path)?;
        Ok(apply_filter(events, filter))
    }
}
