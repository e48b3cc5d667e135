//! Compress strategy.
//!
//! A [`CompressedContext`] keeps a [`PreservedMetadata`] header in the clear so
//! compressed contexts stay searchable, plus a DEFLATE payload of the context
//! JSON. Blobs are encoded with bincode for storage.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::sync::Arc;
use tessera_core::{
    clamp_unit, CompressionAlgorithm, Context, ContextId, ContextType, SemanticLimits,
    TesseraError, TesseraResult, Timestamp, ValidationError,
};
use tracing::debug;

// ============================================================================
// TYPES
// ============================================================================

/// Metadata kept uncompressed alongside the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreservedMetadata {
    pub context_id: ContextId,
    pub context_type: ContextType,
    pub version: u64,
    pub priority: u8,
    pub relevance_score: f64,
    pub tags: BTreeSet<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub last_accessed_at: Timestamp,
    pub expires_at: Option<Timestamp>,
}

impl PreservedMetadata {
    pub fn of(context: &Context) -> Self {
        let meta = &context.metadata;
        Self {
            context_id: context.id,
            context_type: context.context_type,
            version: context.version,
            priority: meta.priority,
            relevance_score: meta.relevance_score,
            tags: meta.tags.clone(),
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            last_accessed_at: meta.last_accessed_at,
            expires_at: meta.expires_at,
        }
    }

    /// Write the preserved fields back onto a decompressed context.
    fn restore_onto(&self, context: &mut Context) {
        context.id = self.context_id;
        context.context_type = self.context_type;
        context.version = self.version;
        let meta = &mut context.metadata;
        meta.priority = self.priority;
        meta.relevance_score = self.relevance_score;
        meta.tags = self.tags.clone();
        meta.created_at = self.created_at;
        meta.updated_at = self.updated_at;
        meta.last_accessed_at = self.last_accessed_at;
        meta.expires_at = self.expires_at;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub original_size: usize,
    pub compressed_size: usize,
    /// `compressed_size / original_size`; below 1.0 means the payload shrank.
    pub ratio: f64,
    /// Estimated fidelity loss in `[0, 1]`. Zero for lossless algorithms.
    pub quality_impact: f64,
}

impl CompressionStats {
    fn new(original_size: usize, compressed_size: usize, quality_impact: f64) -> Self {
        let ratio = if original_size == 0 {
            1.0
        } else {
            compressed_size as f64 / original_size as f64
        };
        Self {
            original_size,
            compressed_size,
            ratio,
            quality_impact: clamp_unit(quality_impact),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedContext {
    pub algorithm: CompressionAlgorithm,
    pub preserved: PreservedMetadata,
    pub data: Vec<u8>,
    pub stats: CompressionStats,
}

fn codec_error(reason: impl ToString) -> TesseraError {
    ValidationError::ConstraintViolation {
        constraint: "compressed-payload".to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn deflate(bytes: &[u8]) -> TesseraResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(codec_error)?;
    encoder.finish().map_err(codec_error)
}

fn inflate(bytes: &[u8]) -> TesseraResult<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(codec_error)?;
    Ok(out)
}

fn context_bytes(context: &Context) -> TesseraResult<Vec<u8>> {
    serde_json::to_vec(context).map_err(codec_error)
}

fn decode_payload(compressed: &CompressedContext) -> TesseraResult<Context> {
    let json = inflate(&compressed.data)?;
    let mut context: Context = serde_json::from_slice(&json).map_err(codec_error)?;
    compressed.preserved.restore_onto(&mut context);
    Ok(context)
}

// ============================================================================
// COMPRESSORS
// ============================================================================

/// A pluggable compression algorithm.
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, context: &Context) -> TesseraResult<CompressedContext>;

    fn decompress(&self, compressed: &CompressedContext) -> TesseraResult<Context> {
        decode_payload(compressed)
    }
}

/// DEFLATE of the full context JSON. Round trips byte for byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct LosslessCompressor;

impl Compressor for LosslessCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lossless
    }

    fn compress(&self, context: &Context) -> TesseraResult<CompressedContext> {
        let raw = context_bytes(context)?;
        let data = deflate(&raw)?;
        let stats = CompressionStats::new(raw.len(), data.len(), 0.0);
        Ok(CompressedContext {
            algorithm: self.algorithm(),
            preserved: PreservedMetadata::of(context),
            data,
            stats,
        })
    }
}

/// Shortens long strings and arrays in the content, then deflates.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemanticCompressor {
    limits: SemanticLimits,
}

impl SemanticCompressor {
    pub fn new(limits: SemanticLimits) -> Self {
        Self { limits }
    }

    fn reduce(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(truncate_text(s, self.limits.max_string_len)),
            Value::Array(items) => {
                let skip = items.len().saturating_sub(self.limits.max_array_len);
                Value::Array(items.iter().skip(skip).map(|v| self.reduce(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.reduce(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl Compressor for SemanticCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Semantic
    }

    fn compress(&self, context: &Context) -> TesseraResult<CompressedContext> {
        let raw = context_bytes(context)?;
        let mut reduced = context.clone();
        reduced.content = self.reduce(&context.content);

        let before = serde_json::to_vec(&context.content).map_err(codec_error)?.len();
        let after = serde_json::to_vec(&reduced.content).map_err(codec_error)?.len();
        let quality_impact = if before == 0 {
            0.0
        } else {
            1.0 - after as f64 / before as f64
        };

        let data = deflate(&context_bytes(&reduced)?)?;
        let stats = CompressionStats::new(raw.len(), data.len(), quality_impact);
        Ok(CompressedContext {
            algorithm: self.algorithm(),
            preserved: PreservedMetadata::of(context),
            data,
            stats,
        })
    }
}

/// Cut `text` to at most `max_chars` characters, preferring a sentence end in
/// the latter half, then a word boundary in the last fifth.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let cut = match text.char_indices().nth(max_chars) {
        Some((idx, _)) => idx,
        None => return text.to_string(),
    };
    let truncated = &text[..cut];

    let last_sentence = ['.', '?', '!']
        .into_iter()
        .filter_map(|c| truncated.rfind(c))
        .max();
    if let Some(pos) = last_sentence {
        if pos > cut / 2 {
            return truncated[..=pos].to_string();
        }
    }
    if let Some(pos) = truncated.rfind(' ') {
        if pos > cut * 4 / 5 {
            return truncated[..pos].to_string();
        }
    }
    truncated.to_string()
}

// ============================================================================
// STRATEGY
// ============================================================================

/// Registry of compressors keyed by algorithm.
#[derive(Clone)]
pub struct CompressStrategy {
    compressors: HashMap<CompressionAlgorithm, Arc<dyn Compressor>>,
}

impl std::fmt::Debug for CompressStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut algorithms: Vec<&str> = self.compressors.keys().map(|a| a.as_str()).collect();
        algorithms.sort_unstable();
        f.debug_struct("CompressStrategy")
            .field("algorithms", &algorithms)
            .finish()
    }
}

impl CompressStrategy {
    /// Lossless and semantic compressors registered.
    pub fn new(limits: SemanticLimits) -> Self {
        let mut strategy = Self {
            compressors: HashMap::new(),
        };
        strategy.register(Arc::new(LosslessCompressor));
        strategy.register(Arc::new(SemanticCompressor::new(limits)));
        strategy
    }

    /// Install or replace the compressor for its algorithm.
    pub fn register(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressors.insert(compressor.algorithm(), compressor);
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> TesseraResult<&Arc<dyn Compressor>> {
        self.compressors.get(&algorithm).ok_or_else(|| {
            ValidationError::InvalidValue {
                field: "algorithm".to_string(),
                reason: format!("no compressor registered for {}", algorithm),
            }
            .into()
        })
    }

    pub fn compress(&self, context: &Context, algorithm: CompressionAlgorithm) -> TesseraResult<CompressedContext> {
        let compressed = self.compressor(algorithm)?.compress(context)?;
        debug!(
            context_id = %context.id,
            algorithm = %algorithm,
            original_size = compressed.stats.original_size,
            compressed_size = compressed.stats.compressed_size,
            "context compressed"
        );
        Ok(compressed)
    }

    pub fn decompress(&self, compressed: &CompressedContext) -> TesseraResult<Context> {
        self.compressor(compressed.algorithm)?.decompress(compressed)
    }

    /// Binary blob form for storage.
    pub fn encode(compressed: &CompressedContext) -> TesseraResult<Vec<u8>> {
        bincode::serialize(compressed).map_err(codec_error)
    }

    pub fn decode(bytes: &[u8]) -> TesseraResult<CompressedContext> {
        bincode::deserialize(bytes).map_err(codec_error)
    }
}

impl Default for CompressStrategy {
    fn default() -> Self {
        Self::new(SemanticLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{ContextMetadata, ErrorKind};

    fn conversation(messages: usize, text: &str) -> Context {
        let messages: Vec<Value> = (0..messages)
            .map(|i| json!({ "role": "user", "n": i, "text": text }))
            .collect();
        Context::new(
            ContextType::Conversation,
            json!({ "messages": messages }),
            ContextMetadata::default().with_tags(["chat"]).with_priority(7),
        )
    }

    #[test]
    fn test_lossless_round_trip_identical() {
        let strategy = CompressStrategy::default();
        let ctx = conversation(50, "the quick brown fox jumps over the lazy dog");
        let compressed = strategy.compress(&ctx, CompressionAlgorithm::Lossless).unwrap();
        assert!(compressed.stats.ratio < 1.0);
        assert_eq!(compressed.stats.quality_impact, 0.0);
        let back = strategy.decompress(&compressed).unwrap();
        assert_eq!(
            serde_json::to_vec(&back).unwrap(),
            serde_json::to_vec(&ctx).unwrap()
        );
    }

    #[test]
    fn test_semantic_reduces_and_reports_impact() {
        let strategy = CompressStrategy::new(SemanticLimits {
            max_string_len: 10,
            max_array_len: 5,
        });
        let ctx = conversation(40, "First sentence here. Second sentence is longer.");
        let compressed = strategy.compress(&ctx, CompressionAlgorithm::Semantic).unwrap();
        let impact = compressed.stats.quality_impact;
        assert!(impact > 0.0 && impact <= 1.0);

        let back = strategy.decompress(&compressed).unwrap();
        let messages = back.content["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[4]["n"], 39);
        assert_eq!(PreservedMetadata::of(&back), compressed.preserved);
    }

    #[test]
    fn test_preserved_metadata_readable_without_payload() {
        let strategy = CompressStrategy::default();
        let ctx = conversation(2, "hi");
        let blob = CompressStrategy::encode(
            &strategy.compress(&ctx, CompressionAlgorithm::Lossless).unwrap(),
        )
        .unwrap();
        let decoded = CompressStrategy::decode(&blob).unwrap();
        assert_eq!(decoded.preserved.context_id, ctx.id);
        assert_eq!(decoded.preserved.priority, 7);
        assert!(decoded.preserved.tags.contains("chat"));
    }

    #[test]
    fn test_corrupt_payload_is_rejected() {
        let strategy = CompressStrategy::default();
        let mut compressed = strategy
            .compress(&conversation(1, "x"), CompressionAlgorithm::Lossless)
            .unwrap();
        compressed.data = vec![0xff, 0x00, 0x13];
        let err = strategy.decompress(&compressed).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn test_truncate_text_boundaries() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("anything", 0), "");
        assert_eq!(
            truncate_text("One two three. Four five six seven", 20),
            "One two three."
        );
        assert_eq!(truncate_text("héllo wörld ünïcode", 7), "héllo w");
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tessera_core::ContextMetadata;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_semantic_impact_in_unit_range(
            items in proptest::collection::vec("\\PC{0,300}", 0..40),
            max_string_len in 1usize..64,
            max_array_len in 1usize..10,
        ) {
            let ctx = Context::new(
                ContextType::Knowledge,
                json!({ "items": items }),
                ContextMetadata::default(),
            );
            let compressor = SemanticCompressor::new(SemanticLimits { max_string_len, max_array_len });
            let compressed = compressor.compress(&ctx).unwrap();
            prop_assert!((0.0..=1.0).contains(&compressed.stats.quality_impact));
            let back = compressor.decompress(&compressed).unwrap();
            prop_assert_eq!(PreservedMetadata::of(&back), PreservedMetadata::of(&ctx));
        }

        #[test]
        fn prop_truncate_never_exceeds_limit(text in "\\PC{0,200}", max in 0usize..100) {
            let out = truncate_text(&text, max);
            prop_assert!(out.chars().count() <= max);
            prop_assert!(text.starts_with(&out));
        }
    }
}
