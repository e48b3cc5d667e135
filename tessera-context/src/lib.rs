//! Tessera Context - Repository and Strategy Engine
//!
//! [`ContextRepository`] owns contexts, their lifecycle state and version
//! counters. [`StrategyEngine`] layers the four strategies on top:
//!
//! - Write: externalize a context into a namespace and resolve it again
//! - Select: weighted relevance/recency/priority scoring and top-k ranking
//! - Compress: lossless or semantic compression with preserved metadata
//! - Isolate: boundaries, permission checks and field projection

mod engine;
mod repository;
pub mod strategy;

pub use engine::StrategyEngine;
pub use repository::{ContextRepository, RelationshipRecord};
pub use strategy::{
    AccessDecision, CompressStrategy, CompressedContext, CompressionStats, ContextReference,
    FieldProjection, IsolateStrategy, KeywordScorer, MultiCriteriaWeights, PartialContext,
    PreservedMetadata, RelevanceScorer, ScoreBreakdown, ScoredContext, SelectStrategy,
    SelectionQuery, WriteStrategy,
};
