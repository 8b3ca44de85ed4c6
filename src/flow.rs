//! Flow orchestration
//!
//! Runs one query through the full pipeline: sanitize, canonicalize,
//! retrieve, and on a miss generate, repair, validate, and persist.
//! Every invocation writes exactly one flow-run audit record, success
//! or failure, and failures surface only a generic message to the
//! caller while the trace keeps the real error.

use crate::canonicalize::{self, STRUCTURE_VERSION};
use crate::error::FlowError;
use crate::gateway::ModelGateway;
use crate::normalize;
use crate::prompt::{self, PromptBundle};
use crate::query::sanitize_query;
use crate::schema::{self, ExplanationContent, Level, SUPPORTED_BLOCK_TYPES};
use crate::store::{
    ExplanationRecord, ExplanationStore, FlowRunRecord, VariantLabel, VariantMetadata,
    VariantRecord, Visibility, VisibilityFilter,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// The only failure text callers ever see. Internals stay in the trace.
pub const GENERIC_FAILURE_MESSAGE: &str =
    "Something went wrong while generating the explanation. Please try again in a moment.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowMode {
    Default,
    NewVariant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Success,
    Retrieved,
    Failed,
}

/// One pipeline invocation.
#[derive(Debug, Clone)]
pub struct FlowRequest {
    pub raw_query: String,
    pub level: Level,
    pub mode: FlowMode,
    pub force_generate: bool,
}

impl FlowRequest {
    pub fn new(raw_query: impl Into<String>, level: Level) -> Self {
        Self {
            raw_query: raw_query.into(),
            level,
            mode: FlowMode::Default,
            force_generate: false,
        }
    }
}

/// What the caller gets back. On failure only `message` is populated
/// beyond the run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResult {
    pub status: FlowStatus,
    pub cache_hit: bool,
    pub flow_run_id: Uuid,
    pub explanation: Option<ExplanationContent>,
    pub explanation_id: Option<Uuid>,
    pub variant_id: Option<Uuid>,
    pub message: Option<String>,
}

// ─── Trace ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputTrace {
    pub raw_query: String,
    pub level: Level,
    pub mode: FlowMode,
    pub force_generate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalizeTrace {
    pub input: String,
    pub canonical_topic: String,
    pub canonical_key: String,
    pub group_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalTrace {
    pub hit: bool,
    pub explanation_id: Option<Uuid>,
    pub variant_id: Option<Uuid>,
    pub visibility: Option<Visibility>,
    pub group_key: String,
    pub matching_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCallTrace {
    pub model: String,
    pub raw_output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseTrace {
    pub success: bool,
    pub parsed_json: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationTrace {
    pub success: bool,
    pub errors: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTypeTrace {
    #[serde(rename = "type")]
    pub block_type: String,
    pub supported: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderPreviewTrace {
    pub block_types: Vec<BlockTypeTrace>,
    pub unknown_blocks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistTrace {
    pub explanation_id: Uuid,
    pub variant_id: Uuid,
}

/// Stage-by-stage record of one run. Stages that never ran stay `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowTrace {
    pub input: Option<InputTrace>,
    pub canonicalize: Option<CanonicalizeTrace>,
    pub retrieval: Option<RetrievalTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_build: Option<PromptBundle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_call: Option<ModelCallTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse: Option<ParseTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_preview: Option<RenderPreviewTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist: Option<PersistTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Variant hints ──────────────────────────────────────────────────────────

const VARIANT_HINTS: [&str; 4] = [
    "Use a fresh metaphor that avoids water or plumbing.",
    "Emphasize a different physical intuition.",
    "Swap the ordering of steps to vary the flow.",
    "Use a concrete everyday example that is not about cars.",
];

/// Deterministic hint selection: a polynomial hash of the group key's
/// UTF-16 code units, reduced modulo the hint count at every step.
fn suggest_variant_hint(group_key: &str) -> &'static str {
    let mut hash: usize = 0;
    for unit in group_key.encode_utf16() {
        hash = (hash * 31 + unit as usize) % VARIANT_HINTS.len();
    }
    VARIANT_HINTS[hash]
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// Run one query through the pipeline end to end.
///
/// Returns `Err` only when the audit record itself cannot be written;
/// every pipeline failure is captured as a `Failed` result instead.
pub async fn run_flow<S: ExplanationStore, G: ModelGateway>(
    store: &S,
    gateway: &G,
    request: FlowRequest,
) -> anyhow::Result<FlowResult> {
    let sanitized = sanitize_query(&request.raw_query);
    let mut trace = FlowTrace {
        input: Some(InputTrace {
            raw_query: sanitized.clone(),
            level: request.level,
            mode: request.mode,
            force_generate: request.force_generate,
        }),
        ..FlowTrace::default()
    };

    match run_pipeline(store, gateway, &request, &sanitized, &mut trace).await {
        Ok(result) => Ok(result),
        Err(err) => {
            let message = err.to_string();
            warn!(error = %message, "flow failed");
            trace.error = Some(message.clone());

            let canonical_topic = trace
                .canonicalize
                .as_ref()
                .map(|c| c.canonical_topic.clone());
            let group_key = trace.canonicalize.as_ref().map(|c| c.group_key.clone());

            let run_id = Uuid::new_v4();
            store.insert_flow_run(FlowRunRecord {
                id: run_id,
                raw_query: sanitized,
                level: request.level,
                status: FlowStatus::Failed,
                cache_hit: false,
                canonical_topic,
                group_key,
                error_message: Some(message),
                trace,
                created_at: Utc::now(),
            })?;

            Ok(FlowResult {
                status: FlowStatus::Failed,
                cache_hit: false,
                flow_run_id: run_id,
                explanation: None,
                explanation_id: None,
                variant_id: None,
                message: Some(GENERIC_FAILURE_MESSAGE.to_string()),
            })
        }
    }
}

async fn run_pipeline<S: ExplanationStore, G: ModelGateway>(
    store: &S,
    gateway: &G,
    request: &FlowRequest,
    sanitized: &str,
    trace: &mut FlowTrace,
) -> anyhow::Result<FlowResult> {
    let canonical = canonicalize::canonicalize(sanitized);
    let group_key =
        canonicalize::build_group_key(&canonical.canonical_topic, request.level, STRUCTURE_VERSION);

    trace.canonicalize = Some(CanonicalizeTrace {
        input: sanitized.to_string(),
        canonical_topic: canonical.canonical_topic.clone(),
        canonical_key: canonical.canonical_key.clone(),
        group_key: group_key.clone(),
    });
    trace.retrieval = Some(RetrievalTrace {
        group_key: group_key.clone(),
        ..RetrievalTrace::default()
    });

    // Public copies win; otherwise any non-blocked copy is reusable.
    let existing = match store.find_latest_explanation(
        &group_key,
        request.level,
        VisibilityFilter::Public,
    )? {
        Some(record) => Some(record),
        None => store.find_latest_explanation(
            &group_key,
            request.level,
            VisibilityFilter::NotBlocked,
        )?,
    };

    if let Some(existing) = &existing {
        if request.mode == FlowMode::Default && !request.force_generate {
            let best_variant = store.best_variant(existing.id)?;

            trace.retrieval = Some(RetrievalTrace {
                hit: true,
                explanation_id: Some(existing.id),
                variant_id: best_variant.as_ref().map(|v| v.id),
                visibility: Some(existing.visibility),
                group_key: group_key.clone(),
                matching_keys: vec![group_key.clone()],
            });

            debug!(group_key = %group_key, "cache hit, returning stored explanation");

            let run_id = Uuid::new_v4();
            store.insert_flow_run(FlowRunRecord {
                id: run_id,
                raw_query: sanitized.to_string(),
                level: request.level,
                status: FlowStatus::Retrieved,
                cache_hit: true,
                canonical_topic: Some(canonical.canonical_topic.clone()),
                group_key: Some(group_key),
                error_message: None,
                trace: trace.clone(),
                created_at: Utc::now(),
            })?;

            let content = best_variant
                .as_ref()
                .map(|v| v.content.clone())
                .unwrap_or_else(|| existing.content.clone());

            return Ok(FlowResult {
                status: FlowStatus::Retrieved,
                cache_hit: true,
                flow_run_id: run_id,
                explanation: Some(content),
                explanation_id: Some(existing.id),
                variant_id: best_variant.map(|v| v.id),
                message: None,
            });
        }
    }

    // Miss or forced generation.
    let variant_hint = match request.mode {
        FlowMode::NewVariant => Some(suggest_variant_hint(&group_key)),
        FlowMode::Default => None,
    };
    let bundle = prompt::build_prompt(&canonical.canonical_topic, request.level, variant_hint);
    trace.prompt_build = Some(bundle.clone());

    let raw_output = gateway.call(&bundle.system_prompt, &bundle.user_prompt).await?;
    trace.model_call = Some(ModelCallTrace {
        model: gateway.model_id().to_string(),
        raw_output: raw_output.clone(),
    });

    let parsed = match normalize::parse(&raw_output) {
        Ok(value) => {
            trace.parse = Some(ParseTrace {
                success: true,
                parsed_json: Some(value.clone()),
                error: None,
            });
            value
        }
        Err(err) => {
            trace.parse = Some(ParseTrace {
                success: false,
                parsed_json: None,
                error: Some(err.to_string()),
            });
            anyhow::bail!("Failed to parse model response as JSON.");
        }
    };

    let normalized = normalize::normalize(parsed, &canonical.canonical_topic, request.level);

    let content = match schema::validate(&normalized) {
        Ok(content) => {
            trace.validation = Some(ValidationTrace {
                success: true,
                errors: None,
            });
            content
        }
        Err(err) => {
            let errors = match &err {
                FlowError::Validation(errors) => errors.clone(),
                other => vec![other.to_string()],
            };
            trace.validation = Some(ValidationTrace {
                success: false,
                errors: Some(errors),
            });
            anyhow::bail!("Model response failed schema validation.");
        }
    };

    let block_types: Vec<BlockTypeTrace> = content
        .blocks
        .iter()
        .map(|block| BlockTypeTrace {
            block_type: block.type_name().to_string(),
            supported: SUPPORTED_BLOCK_TYPES.contains(&block.type_name()),
        })
        .collect();
    let unknown_blocks = block_types
        .iter()
        .filter(|b| !b.supported)
        .map(|b| b.block_type.clone())
        .collect();
    trace.render_preview = Some(RenderPreviewTrace {
        block_types,
        unknown_blocks,
    });

    let explanation_id = match &existing {
        Some(record) => record.id,
        None => {
            let id = Uuid::new_v4();
            let now = Utc::now();
            store.insert_explanation(ExplanationRecord {
                id,
                canonical_key: canonical.canonical_key.clone(),
                canonical_topic: canonical.canonical_topic.clone(),
                group_key: group_key.clone(),
                level: request.level,
                structure_version: STRUCTURE_VERSION.to_string(),
                content: content.clone(),
                visibility: Visibility::Private,
                blocked_reason: None,
                created_at: now,
                updated_at: now,
            })?;
            id
        }
    };

    let variant_id = Uuid::new_v4();
    store.insert_variant(VariantRecord {
        id: variant_id,
        explanation_id,
        group_key: group_key.clone(),
        variant_label: match request.mode {
            FlowMode::NewVariant => VariantLabel::Variant,
            FlowMode::Default => VariantLabel::Base,
        },
        content: content.clone(),
        metadata: VariantMetadata {
            level: request.level,
            mode: request.mode,
            variant_hint: variant_hint.map(str::to_string),
        },
        helpful_score: 0,
        metaphor_tags: Vec::new(),
        created_at: Utc::now(),
    })?;

    // The explanation always carries the freshest validated content.
    store.update_explanation_content(explanation_id, &content)?;

    trace.persist = Some(PersistTrace {
        explanation_id,
        variant_id,
    });

    let run_id = Uuid::new_v4();
    store.insert_flow_run(FlowRunRecord {
        id: run_id,
        raw_query: sanitized.to_string(),
        level: request.level,
        status: FlowStatus::Success,
        cache_hit: false,
        canonical_topic: Some(canonical.canonical_topic),
        group_key: Some(group_key),
        error_message: None,
        trace: trace.clone(),
        created_at: Utc::now(),
    })?;

    Ok(FlowResult {
        status: FlowStatus::Success,
        cache_hit: false,
        flow_run_id: run_id,
        explanation: Some(content),
        explanation_id: Some(explanation_id),
        variant_id: Some(variant_id),
        message: None,
    })
}

/// Whether an explanation already exists for this query and level,
/// without touching the model or writing any records.
pub fn check_explain_cache<S: ExplanationStore>(
    store: &S,
    raw_query: &str,
    level: Level,
) -> anyhow::Result<bool> {
    let sanitized = sanitize_query(raw_query);
    let canonical = canonicalize::canonicalize(&sanitized);
    let group_key = canonicalize::build_group_key(&canonical.canonical_topic, level, STRUCTURE_VERSION);

    if store
        .find_latest_explanation(&group_key, level, VisibilityFilter::Public)?
        .is_some()
    {
        return Ok(true);
    }
    Ok(store
        .find_latest_explanation(&group_key, level, VisibilityFilter::NotBlocked)?
        .is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockGateway {
        calls: AtomicUsize,
        response: String,
    }

    impl MockGateway {
        fn returning(response: impl Into<String>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: response.into(),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ModelGateway for MockGateway {
        fn model_id(&self) -> &str {
            "mock-model"
        }

        async fn call(&self, _system: &str, _user: &str) -> Result<String, FlowError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    fn valid_model_output(topic: &str) -> String {
        json!({
            "topic": topic,
            "level": "eli5",
            "title": format!("Understanding {}", topic),
            "summary": "A clear summary that is easily long enough to pass validation.",
            "blocks": [
                {"type": "heading", "text": "Overview"},
                {"type": "paragraph", "text": "A paragraph with plenty of content in it."},
                {"type": "check", "questions": ["What is the main idea here?"]}
            ],
            "relatedTopics": ["orbits", "mass"]
        })
        .to_string()
    }

    #[tokio::test]
    async fn miss_generates_and_persists_private_explanation() {
        let store = MemoryStore::new();
        let gateway = MockGateway::returning(valid_model_output("gravity"));

        let result = run_flow(&store, &gateway, FlowRequest::new("Explain gravity!", Level::Eli5))
            .await
            .unwrap();

        assert_eq!(result.status, FlowStatus::Success);
        assert!(!result.cache_hit);
        assert_eq!(gateway.call_count(), 1);
        assert_eq!(store.flow_run_count(), 1);
        assert_eq!(store.explanation_count(), 1);

        let explanation = store
            .get_explanation(result.explanation_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(explanation.visibility, Visibility::Private);
        assert_eq!(explanation.group_key, "gravity|eli5|v1");
        assert_eq!(store.count_variants(explanation.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn cache_hit_never_calls_the_model() {
        let store = MemoryStore::new();
        let gateway = MockGateway::returning(valid_model_output("gravity"));

        run_flow(&store, &gateway, FlowRequest::new("gravity", Level::Eli5))
            .await
            .unwrap();
        assert_eq!(gateway.call_count(), 1);

        let result = run_flow(
            &store,
            &gateway,
            FlowRequest::new("Explain gravity?", Level::Eli5),
        )
        .await
        .unwrap();

        assert_eq!(result.status, FlowStatus::Retrieved);
        assert!(result.cache_hit);
        assert!(result.explanation.is_some());
        assert_eq!(gateway.call_count(), 1);
        assert_eq!(store.flow_run_count(), 2);
        assert_eq!(store.explanation_count(), 1);
    }

    #[tokio::test]
    async fn force_generate_bypasses_the_cache() {
        let store = MemoryStore::new();
        let gateway = MockGateway::returning(valid_model_output("gravity"));

        run_flow(&store, &gateway, FlowRequest::new("gravity", Level::Eli5))
            .await
            .unwrap();

        let mut request = FlowRequest::new("gravity", Level::Eli5);
        request.force_generate = true;
        let result = run_flow(&store, &gateway, request).await.unwrap();

        assert_eq!(result.status, FlowStatus::Success);
        assert!(!result.cache_hit);
        assert_eq!(gateway.call_count(), 2);
        assert_eq!(store.explanation_count(), 1);
    }

    #[tokio::test]
    async fn new_variant_mode_accumulates_variants() {
        let store = MemoryStore::new();
        let gateway = MockGateway::returning(valid_model_output("gravity"));

        let mut explanation_id = None;
        for _ in 0..3 {
            let mut request = FlowRequest::new("gravity", Level::Eli5);
            request.mode = FlowMode::NewVariant;
            let result = run_flow(&store, &gateway, request).await.unwrap();
            assert_eq!(result.status, FlowStatus::Success);
            explanation_id = result.explanation_id;
        }

        let explanation_id = explanation_id.unwrap();
        assert_eq!(store.explanation_count(), 1);
        assert_eq!(store.count_variants(explanation_id).unwrap(), 3);
        assert_eq!(gateway.call_count(), 3);

        let run = store
            .get_flow_run(
                run_flow(&store, &gateway, {
                    let mut r = FlowRequest::new("gravity", Level::Eli5);
                    r.mode = FlowMode::NewVariant;
                    r
                })
                .await
                .unwrap()
                .flow_run_id,
            )
            .unwrap()
            .unwrap();
        let hint = run
            .trace
            .prompt_build
            .as_ref()
            .map(|p| p.user_prompt.contains("Variation hint:"));
        assert_eq!(hint, Some(true));
    }

    #[tokio::test]
    async fn invalid_model_output_fails_closed() {
        let store = MemoryStore::new();
        let gateway = MockGateway::returning(r#"{"title": "Too sparse"}"#);

        let result = run_flow(&store, &gateway, FlowRequest::new("gravity", Level::Eli5))
            .await
            .unwrap();

        assert_eq!(result.status, FlowStatus::Failed);
        assert!(result.explanation.is_none());
        assert_eq!(result.message.as_deref(), Some(GENERIC_FAILURE_MESSAGE));
        assert_eq!(store.explanation_count(), 0);

        let run = store.get_flow_run(result.flow_run_id).unwrap().unwrap();
        assert_eq!(run.status, FlowStatus::Failed);
        assert_eq!(
            run.error_message.as_deref(),
            Some("Model response failed schema validation.")
        );
        let validation = run.trace.validation.unwrap();
        assert!(!validation.success);
        assert!(!validation.errors.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unparseable_output_records_a_failed_run() {
        let store = MemoryStore::new();
        let gateway = MockGateway::returning("definitely not json");

        let result = run_flow(&store, &gateway, FlowRequest::new("gravity", Level::Eli5))
            .await
            .unwrap();

        assert_eq!(result.status, FlowStatus::Failed);
        assert_eq!(store.flow_run_count(), 1);

        let run = store.get_flow_run(result.flow_run_id).unwrap().unwrap();
        assert_eq!(
            run.error_message.as_deref(),
            Some("Failed to parse model response as JSON.")
        );
        assert_eq!(run.group_key.as_deref(), Some("gravity|eli5|v1"));
    }

    #[tokio::test]
    async fn blocked_explanations_are_invisible_to_retrieval() {
        let store = MemoryStore::new();
        let gateway = MockGateway::returning(valid_model_output("gravity"));

        let first = run_flow(&store, &gateway, FlowRequest::new("gravity", Level::Eli5))
            .await
            .unwrap();
        store
            .set_visibility(first.explanation_id.unwrap(), Visibility::Blocked, None)
            .unwrap();

        let second = run_flow(&store, &gateway, FlowRequest::new("gravity", Level::Eli5))
            .await
            .unwrap();

        assert_eq!(second.status, FlowStatus::Success);
        assert_eq!(gateway.call_count(), 2);
        assert_ne!(second.explanation_id, first.explanation_id);
        assert_eq!(store.explanation_count(), 2);
    }

    #[tokio::test]
    async fn best_variant_content_wins_on_cache_hit() {
        let store = MemoryStore::new();
        let gateway = MockGateway::returning(valid_model_output("gravity"));

        let first = run_flow(&store, &gateway, FlowRequest::new("gravity", Level::Eli5))
            .await
            .unwrap();
        store
            .increment_helpful_score(first.variant_id.unwrap())
            .unwrap();

        let hit = run_flow(&store, &gateway, FlowRequest::new("gravity", Level::Eli5))
            .await
            .unwrap();
        assert_eq!(hit.variant_id, first.variant_id);
    }

    #[test]
    fn variant_hint_is_deterministic_and_from_the_known_set() {
        let a = suggest_variant_hint("gravity|eli5|v1");
        let b = suggest_variant_hint("gravity|eli5|v1");
        assert_eq!(a, b);
        assert!(VARIANT_HINTS.contains(&a));

        let other = suggest_variant_hint("black holes|expert|v1");
        assert!(VARIANT_HINTS.contains(&other));
    }

    #[test]
    fn cache_check_ignores_blocked_copies() {
        let store = MemoryStore::new();
        assert!(!check_explain_cache(&store, "gravity", Level::Eli5).unwrap());

        let mut record = crate::store::tests::sample_explanation("gravity|eli5|v1", Level::Eli5);
        record.visibility = Visibility::Blocked;
        store.insert_explanation(record.clone()).unwrap();
        assert!(!check_explain_cache(&store, "gravity", Level::Eli5).unwrap());

        store
            .set_visibility(record.id, Visibility::Private, None)
            .unwrap();
        assert!(check_explain_cache(&store, "Teach me about gravity?", Level::Eli5).unwrap());
    }
}
