//! Select strategy: score and rank contexts against a query.
//!
//! A context's score is the weighted average of up to four components, each
//! in `[0, 1]`:
//!
//! | Component | Source |
//! |-----------|--------|
//! | content   | [`RelevanceScorer`] over the query text (only when text is given) |
//! | metadata  | tag overlap and type match, or the stored relevance score |
//! | recency   | exponential decay of time since last access |
//! | priority  | `priority / 10` |
//!
//! Components that do not apply are left out of the average rather than
//! counted as zero.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    clamp_unit, normalize_tag, Context, ContextType, SelectionWeights, Timestamp, MAX_PRIORITY,
};

// ============================================================================
// RELEVANCE SCORING
// ============================================================================

/// Pluggable content relevance function.
pub trait RelevanceScorer: Send + Sync {
    /// Relevance of `context` to `query` in `[0, 1]`.
    fn score(&self, context: &Context, query: &str) -> f64;
}

/// Fraction of query terms that appear as words in the context content.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordScorer;

fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

impl RelevanceScorer for KeywordScorer {
    fn score(&self, context: &Context, query: &str) -> f64 {
        let wanted: BTreeSet<String> = terms(query).collect();
        if wanted.is_empty() {
            return 0.0;
        }
        let text = context.text_content();
        let present: HashSet<String> = terms(&text).collect();
        let hits = wanted.iter().filter(|t| present.contains(*t)).count();
        hits as f64 / wanted.len() as f64
    }
}

// ============================================================================
// QUERY AND RESULTS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionQuery {
    pub text: Option<String>,
    pub tags: BTreeSet<String>,
    pub context_types: Vec<ContextType>,
    /// Reference instant for recency. Defaults to the time of the call.
    pub as_of: Option<Timestamp>,
    pub min_score: Option<f64>,
}

impl SelectionQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        if let Some(tag) = normalize_tag(tag) {
            self.tags.insert(tag);
        }
        self
    }

    pub fn context_type(mut self, context_type: ContextType) -> Self {
        if !self.context_types.contains(&context_type) {
            self.context_types.push(context_type);
        }
        self
    }

    pub fn as_of(mut self, as_of: Timestamp) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn min_score(mut self, min_score: f64) -> Self {
        self.min_score = Some(clamp_unit(min_score));
        self
    }
}

/// Per-component scores. `None` means the component did not apply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub content: Option<f64>,
    pub metadata: f64,
    pub recency: f64,
    pub priority: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredContext {
    pub context: Context,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Weights for multi-criteria selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultiCriteriaWeights {
    pub relevance: f64,
    pub recency: f64,
    pub priority: f64,
}

impl Default for MultiCriteriaWeights {
    fn default() -> Self {
        Self {
            relevance: 0.5,
            recency: 0.3,
            priority: 0.2,
        }
    }
}

// ============================================================================
// STRATEGY
// ============================================================================

#[derive(Clone)]
pub struct SelectStrategy {
    weights: SelectionWeights,
    half_life: Duration,
    scorer: Arc<dyn RelevanceScorer>,
}

impl std::fmt::Debug for SelectStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectStrategy")
            .field("weights", &self.weights)
            .field("half_life", &self.half_life)
            .finish()
    }
}

fn weighted(parts: &[(f64, Option<f64>)]) -> f64 {
    let (sum, weight) = parts
        .iter()
        .filter_map(|(w, v)| v.map(|v| (w * v, *w)))
        .fold((0.0, 0.0), |(s, t), (wv, w)| (s + wv, t + w));
    if weight <= 0.0 {
        0.0
    } else {
        clamp_unit(sum / weight)
    }
}

fn rank(mut scored: Vec<ScoredContext>, min_score: Option<f64>, k: usize) -> Vec<ScoredContext> {
    if let Some(min) = min_score {
        scored.retain(|s| s.score >= min);
    }
    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| {
                b.context
                    .metadata
                    .last_accessed_at
                    .cmp(&a.context.metadata.last_accessed_at)
            })
            .then_with(|| a.context.id.cmp(&b.context.id))
    });
    scored.truncate(k);
    scored
}

impl SelectStrategy {
    pub fn new(weights: SelectionWeights, half_life: Duration) -> Self {
        Self {
            weights,
            half_life,
            scorer: Arc::new(KeywordScorer),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn weights(&self) -> &SelectionWeights {
        &self.weights
    }

    fn content_component(&self, context: &Context, query: &SelectionQuery) -> Option<f64> {
        query
            .text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(|t| clamp_unit(self.scorer.score(context, t)))
    }

    fn metadata_component(context: &Context, query: &SelectionQuery) -> f64 {
        let mut parts = Vec::new();
        if !query.tags.is_empty() {
            let hits = query
                .tags
                .iter()
                .filter(|t| context.metadata.tags.contains(*t))
                .count();
            parts.push(hits as f64 / query.tags.len() as f64);
        }
        if !query.context_types.is_empty() {
            let matched = query.context_types.contains(&context.context_type);
            parts.push(if matched { 1.0 } else { 0.0 });
        }
        if parts.is_empty() {
            clamp_unit(context.metadata.relevance_score)
        } else {
            parts.iter().sum::<f64>() / parts.len() as f64
        }
    }

    fn recency_component(&self, context: &Context, as_of: Timestamp) -> f64 {
        let age = (as_of - context.metadata.last_accessed_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let half_life = self.half_life.as_secs_f64();
        if half_life <= 0.0 {
            return 0.0;
        }
        clamp_unit(0.5f64.powf(age.as_secs_f64() / half_life))
    }

    fn priority_component(context: &Context) -> f64 {
        clamp_unit(f64::from(context.metadata.priority) / f64::from(MAX_PRIORITY))
    }

    /// Full score breakdown for one context at a fixed instant.
    pub fn breakdown(&self, context: &Context, query: &SelectionQuery, as_of: Timestamp) -> ScoreBreakdown {
        let content = self.content_component(context, query);
        let metadata = Self::metadata_component(context, query);
        let recency = self.recency_component(context, as_of);
        let priority = Self::priority_component(context);
        let w = &self.weights;
        let total = weighted(&[
            (w.content, content),
            (w.metadata, Some(metadata)),
            (w.recency, Some(recency)),
            (w.priority, Some(priority)),
        ]);
        ScoreBreakdown {
            content,
            metadata,
            recency,
            priority,
            total,
        }
    }

    pub fn score(&self, context: &Context, query: &SelectionQuery) -> f64 {
        let as_of = query.as_of.unwrap_or_else(Utc::now);
        self.breakdown(context, query, as_of).total
    }

    /// At most `k` contexts by descending score; ties go to the most
    /// recently accessed.
    pub fn select_top_k(&self, contexts: &[Context], query: &SelectionQuery, k: usize) -> Vec<ScoredContext> {
        let as_of = query.as_of.unwrap_or_else(Utc::now);
        let scored = contexts
            .iter()
            .map(|ctx| {
                let breakdown = self.breakdown(ctx, query, as_of);
                ScoredContext {
                    context: ctx.clone(),
                    score: breakdown.total,
                    breakdown,
                }
            })
            .collect();
        rank(scored, query.min_score, k)
    }

    /// Aggregate-then-sort with independent relevance/recency/priority weights.
    /// Relevance is the mean of the content and metadata components.
    pub fn select_multi(
        &self,
        contexts: &[Context],
        query: &SelectionQuery,
        weights: MultiCriteriaWeights,
        k: usize,
    ) -> Vec<ScoredContext> {
        let as_of = query.as_of.unwrap_or_else(Utc::now);
        let scored = contexts
            .iter()
            .map(|ctx| {
                let mut breakdown = self.breakdown(ctx, query, as_of);
                let relevance = match breakdown.content {
                    Some(content) => (content + breakdown.metadata) / 2.0,
                    None => breakdown.metadata,
                };
                breakdown.total = weighted(&[
                    (weights.relevance, Some(relevance)),
                    (weights.recency, Some(breakdown.recency)),
                    (weights.priority, Some(breakdown.priority)),
                ]);
                ScoredContext {
                    context: ctx.clone(),
                    score: breakdown.total,
                    breakdown,
                }
            })
            .collect();
        rank(scored, query.min_score, k)
    }
}
