//! Cache & persistence store
//!
//! Holds canonical explanations, their append-only variants, and the
//! flow-run audit log. The pipeline talks to the [`ExplanationStore`]
//! trait; [`MemoryStore`] backs tests and [`JsonStore`] persists to a
//! data directory as JSON plus an append-only JSONL run log.
//!
//! Store operations here are not best-effort: a failed write surfaces to
//! the orchestrator, which records it in the run's failure state.

use crate::flow::{FlowMode, FlowStatus, FlowTrace};
use crate::schema::{ExplanationContent, Level};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Moderation state of a canonical explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
    Blocked,
}

/// Which visibilities a retrieval pass may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityFilter {
    Public,
    NotBlocked,
}

impl VisibilityFilter {
    fn matches(&self, visibility: Visibility) -> bool {
        match self {
            VisibilityFilter::Public => visibility == Visibility::Public,
            VisibilityFilter::NotBlocked => visibility != Visibility::Blocked,
        }
    }
}

/// The canonical, publishable answer for a (topic, level) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationRecord {
    pub id: Uuid,
    pub canonical_key: String,
    pub canonical_topic: String,
    pub group_key: String,
    pub level: Level,
    pub structure_version: String,
    pub content: ExplanationContent,
    pub visibility: Visibility,
    /// Why the explanation was pulled; present only while blocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which pipeline mode produced a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariantLabel {
    Base,
    Variant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantMetadata {
    pub level: Level,
    pub mode: FlowMode,
    pub variant_hint: Option<String>,
}

/// One concrete rendering of an explanation's content. Append-only:
/// variants are never deleted or overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantRecord {
    pub id: Uuid,
    pub explanation_id: Uuid,
    pub group_key: String,
    pub variant_label: VariantLabel,
    pub content: ExplanationContent,
    pub metadata: VariantMetadata,
    pub helpful_score: i64,
    /// Reserved; currently always empty.
    pub metaphor_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit record of one orchestrator invocation. Exactly one is written
/// per call, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRunRecord {
    pub id: Uuid,
    pub raw_query: String,
    pub level: Level,
    pub status: FlowStatus,
    pub cache_hit: bool,
    pub canonical_topic: Option<String>,
    pub group_key: Option<String>,
    pub error_message: Option<String>,
    pub trace: FlowTrace,
    pub created_at: DateTime<Utc>,
}

/// Keyed record store consumed by the pipeline.
pub trait ExplanationStore {
    /// Most-recently-updated explanation for a group key and level that
    /// passes the visibility filter.
    fn find_latest_explanation(
        &self,
        group_key: &str,
        level: Level,
        filter: VisibilityFilter,
    ) -> anyhow::Result<Option<ExplanationRecord>>;

    fn get_explanation(&self, id: Uuid) -> anyhow::Result<Option<ExplanationRecord>>;

    fn insert_explanation(&self, record: ExplanationRecord) -> anyhow::Result<()>;

    /// Overwrite content in place and bump `updated_at`.
    fn update_explanation_content(
        &self,
        id: Uuid,
        content: &ExplanationContent,
    ) -> anyhow::Result<()>;

    /// Change visibility, recording a reason when the record is pulled.
    /// Any prior reason is replaced.
    fn set_visibility(
        &self,
        id: Uuid,
        visibility: Visibility,
        reason: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Best variant under an explanation: helpful score descending, then
    /// most recently created.
    fn best_variant(&self, explanation_id: Uuid) -> anyhow::Result<Option<VariantRecord>>;

    fn count_variants(&self, explanation_id: Uuid) -> anyhow::Result<usize>;

    fn insert_variant(&self, record: VariantRecord) -> anyhow::Result<()>;

    fn increment_helpful_score(&self, variant_id: Uuid) -> anyhow::Result<()>;

    fn insert_flow_run(&self, record: FlowRunRecord) -> anyhow::Result<()>;

    fn get_flow_run(&self, id: Uuid) -> anyhow::Result<Option<FlowRunRecord>>;
}

fn pick_latest(
    records: impl Iterator<Item = ExplanationRecord>,
    group_key: &str,
    level: Level,
    filter: VisibilityFilter,
) -> Option<ExplanationRecord> {
    records
        .filter(|r| r.group_key == group_key && r.level == level && filter.matches(r.visibility))
        .max_by_key(|r| r.updated_at)
}

fn pick_best_variant(
    records: impl Iterator<Item = VariantRecord>,
    explanation_id: Uuid,
) -> Option<VariantRecord> {
    records
        .filter(|v| v.explanation_id == explanation_id)
        .max_by_key(|v| (v.helpful_score, v.created_at))
}

// ═══════════════════════════════════════════════════════════════════════════
//  MEMORY STORE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryInner {
    explanations: HashMap<Uuid, ExplanationRecord>,
    variants: HashMap<Uuid, VariantRecord>,
    flow_runs: HashMap<Uuid, FlowRunRecord>,
}

/// In-process store. The mutex guards cross-thread access only; the
/// read-then-write sequence around generation is not mutually excluded
/// per group key.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flow_run_count(&self) -> usize {
        self.inner.lock().expect("store lock").flow_runs.len()
    }

    pub fn explanation_count(&self) -> usize {
        self.inner.lock().expect("store lock").explanations.len()
    }
}

impl ExplanationStore for MemoryStore {
    fn find_latest_explanation(
        &self,
        group_key: &str,
        level: Level,
        filter: VisibilityFilter,
    ) -> anyhow::Result<Option<ExplanationRecord>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(pick_latest(
            inner.explanations.values().cloned(),
            group_key,
            level,
            filter,
        ))
    }

    fn get_explanation(&self, id: Uuid) -> anyhow::Result<Option<ExplanationRecord>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.explanations.get(&id).cloned())
    }

    fn insert_explanation(&self, record: ExplanationRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.explanations.insert(record.id, record);
        Ok(())
    }

    fn update_explanation_content(
        &self,
        id: Uuid,
        content: &ExplanationContent,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let record = inner
            .explanations
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("Explanation {} not found", id))?;
        record.content = content.clone();
        record.updated_at = Utc::now();
        Ok(())
    }

    fn set_visibility(
        &self,
        id: Uuid,
        visibility: Visibility,
        reason: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let record = inner
            .explanations
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("Explanation {} not found", id))?;
        record.visibility = visibility;
        record.blocked_reason = reason.map(str::to_string);
        record.updated_at = Utc::now();
        Ok(())
    }

    fn best_variant(&self, explanation_id: Uuid) -> anyhow::Result<Option<VariantRecord>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(pick_best_variant(
            inner.variants.values().cloned(),
            explanation_id,
        ))
    }

    fn count_variants(&self, explanation_id: Uuid) -> anyhow::Result<usize> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .variants
            .values()
            .filter(|v| v.explanation_id == explanation_id)
            .count())
    }

    fn insert_variant(&self, record: VariantRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.variants.insert(record.id, record);
        Ok(())
    }

    fn increment_helpful_score(&self, variant_id: Uuid) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let record = inner
            .variants
            .get_mut(&variant_id)
            .ok_or_else(|| anyhow::anyhow!("Variant {} not found", variant_id))?;
        record.helpful_score += 1;
        Ok(())
    }

    fn insert_flow_run(&self, record: FlowRunRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.flow_runs.insert(record.id, record);
        Ok(())
    }

    fn get_flow_run(&self, id: Uuid) -> anyhow::Result<Option<FlowRunRecord>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner.flow_runs.get(&id).cloned())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  JSON STORE
// ═══════════════════════════════════════════════════════════════════════════

const EXPLANATIONS_FILE: &str = "explanations.json";
const VARIANTS_FILE: &str = "variants.json";
const FLOW_RUNS_FILE: &str = "flow_runs.jsonl";
const STORE_LOCK_TIMEOUT_SECS: u64 = 5;
const STORE_LOCK_RETRY_MS: u64 = 50;

/// File-backed store: explanations and variants as JSON maps, flow runs
/// as an append-only JSONL log.
pub struct JsonStore {
    data_dir: PathBuf,
}

struct StoreLock {
    file: std::fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl JsonStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn ensure_dir(&self) -> anyhow::Result<()> {
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir)?;
        }
        Ok(())
    }

    fn lock(&self, exclusive: bool) -> anyhow::Result<StoreLock> {
        self.ensure_dir()?;
        let lock_path = self.data_dir.join(".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= Duration::from_secs(STORE_LOCK_TIMEOUT_SECS) {
                        anyhow::bail!(
                            "Timed out waiting for store lock ({}s)",
                            STORE_LOCK_TIMEOUT_SECS
                        );
                    }
                    std::thread::sleep(Duration::from_millis(STORE_LOCK_RETRY_MS));
                }
            }
        }

        Ok(StoreLock { file })
    }

    fn load_map<T: for<'de> Deserialize<'de>>(
        &self,
        file: &str,
    ) -> anyhow::Result<HashMap<Uuid, T>> {
        let path = self.data_dir.join(file);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save_map<T: Serialize>(&self, file: &str, map: &HashMap<Uuid, T>) -> anyhow::Result<()> {
        let path = self.data_dir.join(file);
        let content = serde_json::to_string(map)?;
        write_atomic(&path, &content)
    }
}

impl ExplanationStore for JsonStore {
    fn find_latest_explanation(
        &self,
        group_key: &str,
        level: Level,
        filter: VisibilityFilter,
    ) -> anyhow::Result<Option<ExplanationRecord>> {
        let _lock = self.lock(false)?;
        let map: HashMap<Uuid, ExplanationRecord> = self.load_map(EXPLANATIONS_FILE)?;
        Ok(pick_latest(map.into_values(), group_key, level, filter))
    }

    fn get_explanation(&self, id: Uuid) -> anyhow::Result<Option<ExplanationRecord>> {
        let _lock = self.lock(false)?;
        let map: HashMap<Uuid, ExplanationRecord> = self.load_map(EXPLANATIONS_FILE)?;
        Ok(map.get(&id).cloned())
    }

    fn insert_explanation(&self, record: ExplanationRecord) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let mut map: HashMap<Uuid, ExplanationRecord> = self.load_map(EXPLANATIONS_FILE)?;
        map.insert(record.id, record);
        self.save_map(EXPLANATIONS_FILE, &map)
    }

    fn update_explanation_content(
        &self,
        id: Uuid,
        content: &ExplanationContent,
    ) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let mut map: HashMap<Uuid, ExplanationRecord> = self.load_map(EXPLANATIONS_FILE)?;
        let record = map
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("Explanation {} not found", id))?;
        record.content = content.clone();
        record.updated_at = Utc::now();
        self.save_map(EXPLANATIONS_FILE, &map)
    }

    fn set_visibility(
        &self,
        id: Uuid,
        visibility: Visibility,
        reason: Option<&str>,
    ) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let mut map: HashMap<Uuid, ExplanationRecord> = self.load_map(EXPLANATIONS_FILE)?;
        let record = map
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("Explanation {} not found", id))?;
        record.visibility = visibility;
        record.blocked_reason = reason.map(str::to_string);
        record.updated_at = Utc::now();
        self.save_map(EXPLANATIONS_FILE, &map)
    }

    fn best_variant(&self, explanation_id: Uuid) -> anyhow::Result<Option<VariantRecord>> {
        let _lock = self.lock(false)?;
        let map: HashMap<Uuid, VariantRecord> = self.load_map(VARIANTS_FILE)?;
        Ok(pick_best_variant(map.into_values(), explanation_id))
    }

    fn count_variants(&self, explanation_id: Uuid) -> anyhow::Result<usize> {
        let _lock = self.lock(false)?;
        let map: HashMap<Uuid, VariantRecord> = self.load_map(VARIANTS_FILE)?;
        Ok(map
            .values()
            .filter(|v| v.explanation_id == explanation_id)
            .count())
    }

    fn insert_variant(&self, record: VariantRecord) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let mut map: HashMap<Uuid, VariantRecord> = self.load_map(VARIANTS_FILE)?;
        map.insert(record.id, record);
        self.save_map(VARIANTS_FILE, &map)
    }

    fn increment_helpful_score(&self, variant_id: Uuid) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let mut map: HashMap<Uuid, VariantRecord> = self.load_map(VARIANTS_FILE)?;
        let record = map
            .get_mut(&variant_id)
            .ok_or_else(|| anyhow::anyhow!("Variant {} not found", variant_id))?;
        record.helpful_score += 1;
        self.save_map(VARIANTS_FILE, &map)
    }

    fn insert_flow_run(&self, record: FlowRunRecord) -> anyhow::Result<()> {
        let _lock = self.lock(true)?;
        let path = self.data_dir.join(FLOW_RUNS_FILE);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let row = serde_json::to_string(&record)?;
        use std::io::Write;
        writeln!(file, "{}", row)?;
        Ok(())
    }

    fn get_flow_run(&self, id: Uuid) -> anyhow::Result<Option<FlowRunRecord>> {
        let _lock = self.lock(false)?;
        let path = self.data_dir.join(FLOW_RUNS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str::<FlowRunRecord>(line).ok())
            .find(|run| run.id == id))
    }
}

/// Write content atomically by writing to a temp file first, then renaming.
fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::canonicalize::STRUCTURE_VERSION;
    use crate::schema::Block;

    pub(crate) fn sample_content(topic: &str, level: Level) -> ExplanationContent {
        ExplanationContent {
            topic: topic.to_string(),
            level,
            title: format!("Understanding {}", topic),
            summary: "A short but sufficiently long summary of the idea at hand.".to_string(),
            blocks: vec![
                Block::Heading {
                    text: "Overview".to_string(),
                },
                Block::Paragraph {
                    text: "A paragraph that is long enough to pass validation.".to_string(),
                },
                Block::Check {
                    questions: vec!["What is the key idea here?".to_string()],
                },
            ],
            related_topics: vec!["orbits".to_string(), "mass".to_string()],
        }
    }

    pub(crate) fn sample_explanation(group_key: &str, level: Level) -> ExplanationRecord {
        let now = Utc::now();
        ExplanationRecord {
            id: Uuid::new_v4(),
            canonical_key: "gravity".to_string(),
            canonical_topic: "gravity".to_string(),
            group_key: group_key.to_string(),
            level,
            structure_version: STRUCTURE_VERSION.to_string(),
            content: sample_content("gravity", level),
            visibility: Visibility::Private,
            blocked_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_variant(explanation_id: Uuid, helpful_score: i64) -> VariantRecord {
        VariantRecord {
            id: Uuid::new_v4(),
            explanation_id,
            group_key: "gravity|eli5|v1".to_string(),
            variant_label: VariantLabel::Base,
            content: sample_content("gravity", Level::Eli5),
            metadata: VariantMetadata {
                level: Level::Eli5,
                mode: FlowMode::Default,
                variant_hint: None,
            },
            helpful_score,
            metaphor_tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn public_filter_hides_private_and_blocked() {
        let store = MemoryStore::new();
        let mut record = sample_explanation("gravity|eli5|v1", Level::Eli5);
        record.visibility = Visibility::Private;
        store.insert_explanation(record.clone()).unwrap();

        assert!(store
            .find_latest_explanation("gravity|eli5|v1", Level::Eli5, VisibilityFilter::Public)
            .unwrap()
            .is_none());
        assert!(store
            .find_latest_explanation("gravity|eli5|v1", Level::Eli5, VisibilityFilter::NotBlocked)
            .unwrap()
            .is_some());

        store
            .set_visibility(record.id, Visibility::Blocked, Some("reported"))
            .unwrap();
        assert!(store
            .find_latest_explanation("gravity|eli5|v1", Level::Eli5, VisibilityFilter::NotBlocked)
            .unwrap()
            .is_none());
        let blocked = store.get_explanation(record.id).unwrap().unwrap();
        assert_eq!(blocked.blocked_reason.as_deref(), Some("reported"));
    }

    #[test]
    fn best_variant_orders_by_score_then_recency() {
        let store = MemoryStore::new();
        let explanation = sample_explanation("gravity|eli5|v1", Level::Eli5);
        store.insert_explanation(explanation.clone()).unwrap();

        let low = sample_variant(explanation.id, 1);
        let mut high_old = sample_variant(explanation.id, 5);
        high_old.created_at = Utc::now() - chrono::Duration::hours(2);
        let mut high_new = sample_variant(explanation.id, 5);
        high_new.created_at = Utc::now();

        store.insert_variant(low).unwrap();
        store.insert_variant(high_old).unwrap();
        store.insert_variant(high_new.clone()).unwrap();

        let best = store.best_variant(explanation.id).unwrap().unwrap();
        assert_eq!(best.id, high_new.id);
    }

    #[test]
    fn helpful_score_increments_monotonically() {
        let store = MemoryStore::new();
        let explanation = sample_explanation("gravity|eli5|v1", Level::Eli5);
        let variant = sample_variant(explanation.id, 0);
        store.insert_variant(variant.clone()).unwrap();

        store.increment_helpful_score(variant.id).unwrap();
        store.increment_helpful_score(variant.id).unwrap();
        let best = store.best_variant(explanation.id).unwrap().unwrap();
        assert_eq!(best.helpful_score, 2);
    }

    #[test]
    fn json_store_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        let record = sample_explanation("gravity|eli5|v1", Level::Eli5);
        store.insert_explanation(record.clone()).unwrap();

        let loaded = store.get_explanation(record.id).unwrap().unwrap();
        assert_eq!(loaded.group_key, "gravity|eli5|v1");
        assert_eq!(loaded.visibility, Visibility::Private);

        let updated = sample_content("gravity wells", Level::Eli5);
        store
            .update_explanation_content(record.id, &updated)
            .unwrap();
        let loaded = store.get_explanation(record.id).unwrap().unwrap();
        assert_eq!(loaded.content.topic, "gravity wells");
        assert!(loaded.updated_at >= loaded.created_at);
    }

    #[test]
    fn json_store_appends_flow_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        let run = FlowRunRecord {
            id: Uuid::new_v4(),
            raw_query: "gravity".to_string(),
            level: Level::Eli5,
            status: FlowStatus::Failed,
            cache_hit: false,
            canonical_topic: Some("gravity".to_string()),
            group_key: Some("gravity|eli5|v1".to_string()),
            error_message: Some("model call failed: boom".to_string()),
            trace: FlowTrace::default(),
            created_at: Utc::now(),
        };
        store.insert_flow_run(run.clone()).unwrap();
        store
            .insert_flow_run(FlowRunRecord {
                id: Uuid::new_v4(),
                ..run.clone()
            })
            .unwrap();

        let loaded = store.get_flow_run(run.id).unwrap().unwrap();
        assert_eq!(loaded.error_message.as_deref(), Some("model call failed: boom"));

        let content = fs::read_to_string(dir.path().join(FLOW_RUNS_FILE)).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
