//! Moderation operations
//!
//! Everything here starts from a flow-run id or a record id that an
//! operator already has in hand: promoting a run's explanation to
//! public, re-running or branching a past run, blocking and restoring
//! explanations, and crediting helpful variants.

use crate::flow::{self, FlowMode, FlowRequest, FlowResult};
use crate::gateway::ModelGateway;
use crate::store::{ExplanationStore, FlowRunRecord, Visibility};
use tracing::info;
use uuid::Uuid;

fn require_flow_run<S: ExplanationStore>(store: &S, run_id: Uuid) -> anyhow::Result<FlowRunRecord> {
    store
        .get_flow_run(run_id)?
        .ok_or_else(|| anyhow::anyhow!("Flow run not found"))
}

/// Make the explanation persisted by a run publicly visible.
pub fn promote_flow_run<S: ExplanationStore>(store: &S, run_id: Uuid) -> anyhow::Result<Uuid> {
    let run = require_flow_run(store, run_id)?;
    let explanation_id = run
        .trace
        .persist
        .map(|p| p.explanation_id)
        .ok_or_else(|| anyhow::anyhow!("No explanation found to promote"))?;

    store.set_visibility(explanation_id, Visibility::Public, None)?;
    info!(%explanation_id, "explanation promoted to public");
    Ok(explanation_id)
}

/// Regenerate a past run's explanation, replacing the cached content.
pub async fn rerun_flow<S: ExplanationStore, G: ModelGateway>(
    store: &S,
    gateway: &G,
    run_id: Uuid,
) -> anyhow::Result<FlowResult> {
    let run = require_flow_run(store, run_id)?;
    let input = run
        .trace
        .input
        .ok_or_else(|| anyhow::anyhow!("Missing flow input"))?;

    flow::run_flow(
        store,
        gateway,
        FlowRequest {
            raw_query: input.raw_query,
            level: input.level,
            mode: FlowMode::Default,
            force_generate: true,
        },
    )
    .await
}

/// Generate an additional variant for a past run's topic and level.
pub async fn new_variant_from_run<S: ExplanationStore, G: ModelGateway>(
    store: &S,
    gateway: &G,
    run_id: Uuid,
) -> anyhow::Result<FlowResult> {
    let run = require_flow_run(store, run_id)?;
    let input = run
        .trace
        .input
        .ok_or_else(|| anyhow::anyhow!("Missing flow input"))?;

    flow::run_flow(
        store,
        gateway,
        FlowRequest {
            raw_query: input.raw_query,
            level: input.level,
            mode: FlowMode::NewVariant,
            force_generate: false,
        },
    )
    .await
}

/// Pull an explanation from circulation. Reported content is blocked
/// first and reviewed afterwards; the reason stays on the record so the
/// reviewer restoring it can see why it was pulled.
pub fn block_explanation<S: ExplanationStore>(
    store: &S,
    explanation_id: Uuid,
    reason: &str,
) -> anyhow::Result<()> {
    store
        .get_explanation(explanation_id)?
        .ok_or_else(|| anyhow::anyhow!("Explanation not found"))?;
    store.set_visibility(explanation_id, Visibility::Blocked, Some(reason))?;
    info!(%explanation_id, reason, "explanation blocked");
    Ok(())
}

/// Reinstate a blocked explanation as public.
pub fn restore_explanation<S: ExplanationStore>(
    store: &S,
    explanation_id: Uuid,
) -> anyhow::Result<()> {
    store
        .get_explanation(explanation_id)?
        .ok_or_else(|| anyhow::anyhow!("Explanation not found"))?;
    store.set_visibility(explanation_id, Visibility::Public, None)?;
    info!(%explanation_id, "explanation restored to public");
    Ok(())
}

/// Credit a variant as helpful, nudging it up in best-variant selection.
pub fn record_helpful_signal<S: ExplanationStore>(
    store: &S,
    variant_id: Uuid,
) -> anyhow::Result<()> {
    store.increment_helpful_score(variant_id)?;
    info!(%variant_id, "helpful signal recorded");
    Ok(())
}
