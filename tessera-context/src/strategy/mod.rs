//! The four context strategies.
//!
//! Each strategy is usable on its own; [`crate::StrategyEngine`] composes them
//! over a [`crate::ContextRepository`].

mod compress;
mod isolate;
mod select;
mod write;

pub use compress::{
    truncate_text, CompressStrategy, CompressedContext, CompressionStats, Compressor,
    LosslessCompressor, PreservedMetadata, SemanticCompressor,
};
pub use isolate::{
    AccessDecision, AuditEntry, FieldProjection, IsolateStrategy, PartialContext,
    DEFAULT_AUDIT_CAPACITY,
};
pub use select::{
    KeywordScorer, MultiCriteriaWeights, RelevanceScorer, ScoreBreakdown, ScoredContext,
    SelectStrategy, SelectionQuery,
};
pub use write::{reference_key, ContextReference, WriteStrategy};
