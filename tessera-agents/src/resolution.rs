//! Conflict detection and automatic resolution.
//!
//! Proposals are grouped by field. Within one field the first matching rule
//! classifies the group:
//!
//! - a proposer without write access: `access-violation`
//! - a proposal against another schema version: `schema-mismatch`
//! - two or more agents disagree and every value is an object: `field-modification`
//! - two or more agents disagree otherwise: `concurrent-update`
//!
//! A field proposed by one agent, or on which every agent agrees, is not a
//! conflict.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tessera_core::{
    AgentId, ConflictClock, ConflictRecord, ConflictResolution, ConflictType, Context,
    ProposedChange, ResolutionStrategy,
};

fn latest_per_agent(group: &[ProposedChange]) -> Vec<&ProposedChange> {
    let mut latest: BTreeMap<AgentId, &ProposedChange> = BTreeMap::new();
    for proposal in group {
        let newer = latest
            .get(&proposal.agent_id)
            .map_or(true, |seen| proposal.sequence > seen.sequence);
        if newer {
            latest.insert(proposal.agent_id, proposal);
        }
    }
    let mut out: Vec<&ProposedChange> = latest.into_values().collect();
    out.sort_by_key(|p| p.sequence);
    out
}

fn classify<F>(context: &Context, group: &[ProposedChange], can_write: &F) -> Option<ConflictType>
where
    F: Fn(AgentId) -> bool,
{
    if group.iter().any(|p| !can_write(p.agent_id)) {
        return Some(ConflictType::AccessViolation);
    }
    if group
        .iter()
        .any(|p| p.schema_version != context.metadata.schema_version)
    {
        return Some(ConflictType::SchemaMismatch);
    }
    let latest = latest_per_agent(group);
    let first = latest.first()?;
    if latest.iter().all(|p| p.value == first.value) {
        return None;
    }
    if latest.iter().all(|p| p.value.is_object()) {
        Some(ConflictType::FieldModification)
    } else {
        Some(ConflictType::ConcurrentUpdate)
    }
}

/// Group `proposals` by field and classify each group.
pub fn detect_conflicts<F>(
    context: &Context,
    proposals: &[ProposedChange],
    can_write: F,
) -> Vec<ConflictRecord>
where
    F: Fn(AgentId) -> bool,
{
    let mut by_field: BTreeMap<&str, Vec<ProposedChange>> = BTreeMap::new();
    for proposal in proposals {
        by_field
            .entry(proposal.field.as_str())
            .or_default()
            .push(proposal.clone());
    }
    by_field
        .into_iter()
        .filter_map(|(field, mut group)| {
            group.sort_by_key(|p| p.sequence);
            classify(context, &group, &can_write)
                .map(|kind| ConflictRecord::new(context.id, field, kind, group))
        })
        .collect()
}

/// The value a field settles on when its proposals do not conflict: the
/// most recently accepted one.
pub fn settled_value(group: &[ProposedChange]) -> Option<&Value> {
    group.iter().max_by_key(|p| p.sequence).map(|p| &p.value)
}

/// Pick the latest proposal. Wall-clock ordering compares agent timestamps
/// and falls back to arrival order; logical ordering uses arrival order only.
pub fn last_writer_wins(record: &ConflictRecord, clock: ConflictClock) -> ConflictResolution {
    let winner = record.proposals.iter().max_by(|a, b| match clock {
        ConflictClock::WallClock => (a.timestamp, a.sequence).cmp(&(b.timestamp, b.sequence)),
        ConflictClock::Logical => a.sequence.cmp(&b.sequence),
    });
    ConflictResolution::automatic(
        ResolutionStrategy::LastWriterWins,
        winner.map(|p| p.value.clone()).unwrap_or(Value::Null),
        winner.map(|p| p.agent_id),
    )
}

/// Merge each agent's latest object, in arrival order. On a key collision
/// the earliest proposal keeps the key.
pub fn shallow_merge(record: &ConflictRecord) -> ConflictResolution {
    let mut merged = Map::new();
    for proposal in latest_per_agent(&record.proposals) {
        if let Value::Object(fields) = &proposal.value {
            for (key, value) in fields {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
    ConflictResolution::automatic(ResolutionStrategy::ShallowMerge, Value::Object(merged), None)
}

/// Automatic resolution for the conflict's type, or `None` when a human
/// has to decide.
pub fn auto_resolve(record: &ConflictRecord, clock: ConflictClock) -> Option<ConflictResolution> {
    match record.conflict_type {
        ConflictType::ConcurrentUpdate => Some(last_writer_wins(record, clock)),
        ConflictType::FieldModification => Some(shallow_merge(record)),
        ConflictType::AccessViolation | ConflictType::SchemaMismatch => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tessera_core::{new_entity_id, ContextMetadata, ContextType};

    fn ctx() -> Context {
        Context::new(ContextType::Task, json!({ "title": "t" }), ContextMetadata::default())
    }

    fn proposal(agent: AgentId, field: &str, value: Value, sequence: u64) -> ProposedChange {
        let mut p = ProposedChange::new(agent, field, value);
        p.sequence = sequence;
        p
    }

    #[test]
    fn test_single_agent_no_conflict() {
        let a = new_entity_id();
        let found = detect_conflicts(
            &ctx(),
            &[
                proposal(a, "status", json!("open"), 1),
                proposal(a, "status", json!("closed"), 2),
            ],
            |_| true,
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_agreeing_agents_no_conflict() {
        let found = detect_conflicts(
            &ctx(),
            &[
                proposal(new_entity_id(), "status", json!("done"), 1),
                proposal(new_entity_id(), "status", json!("done"), 2),
            ],
            |_| true,
        );
        assert!(found.is_empty());
    }

    #[test]
    fn test_object_values_are_field_modification() {
        let found = detect_conflicts(
            &ctx(),
            &[
                proposal(new_entity_id(), "profile", json!({ "a": 1 }), 1),
                proposal(new_entity_id(), "profile", json!({ "b": 2 }), 2),
            ],
            |_| true,
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].conflict_type, ConflictType::FieldModification);
        assert!(!found[0].requires_manual_resolution);
    }

    #[test]
    fn test_scalar_values_are_concurrent_update() {
        let found = detect_conflicts(
            &ctx(),
            &[
                proposal(new_entity_id(), "status", json!("open"), 1),
                proposal(new_entity_id(), "status", json!("closed"), 2),
            ],
            |_| true,
        );
        assert_eq!(found[0].conflict_type, ConflictType::ConcurrentUpdate);
    }

    #[test]
    fn test_access_and_schema_violations() {
        let writer = new_entity_id();
        let reader = new_entity_id();
        let found = detect_conflicts(
            &ctx(),
            &[
                proposal(reader, "status", json!("x"), 1),
                proposal(writer, "owner", json!("y"), 2).with_schema_version(2),
            ],
            |agent| agent == writer,
        );
        let kinds: Vec<ConflictType> = found.iter().map(|c| c.conflict_type).collect();
        assert_eq!(
            kinds,
            vec![ConflictType::SchemaMismatch, ConflictType::AccessViolation]
        );
        assert!(found.iter().all(|c| c.requires_manual_resolution));
        assert!(found.iter().all(|c| auto_resolve(c, ConflictClock::WallClock).is_none()));
    }

    #[test]
    fn test_last_writer_wins_by_clock() {
        let early = new_entity_id();
        let late = new_entity_id();
        let now = Utc::now();
        let record = ConflictRecord::new(
            new_entity_id(),
            "status",
            ConflictType::ConcurrentUpdate,
            vec![
                // Arrived last but reports an older clock.
                proposal(early, "status", json!("old"), 2).with_timestamp(now - chrono::Duration::seconds(5)),
                proposal(late, "status", json!("new"), 1).with_timestamp(now),
            ],
        );
        let wall = last_writer_wins(&record, ConflictClock::WallClock);
        assert_eq!(wall.value, json!("new"));
        assert_eq!(wall.winner, Some(late));

        let logical = last_writer_wins(&record, ConflictClock::Logical);
        assert_eq!(logical.value, json!("old"));
    }

    #[test]
    fn test_shallow_merge_first_wins() {
        let record = ConflictRecord::new(
            new_entity_id(),
            "profile",
            ConflictType::FieldModification,
            vec![
                proposal(new_entity_id(), "profile", json!({ "name": "a", "x": 1 }), 1),
                proposal(new_entity_id(), "profile", json!({ "name": "b", "y": 2 }), 2),
            ],
        );
        let merged = shallow_merge(&record);
        assert_eq!(merged.value, json!({ "name": "a", "x": 1, "y": 2 }));
        assert_eq!(merged.strategy, ResolutionStrategy::ShallowMerge);
    }

    #[test]
    fn test_settled_value_is_latest() {
        let a = new_entity_id();
        let group = vec![
            proposal(a, "f", json!(1), 4),
            proposal(a, "f", json!(2), 9),
        ];
        assert_eq!(settled_value(&group), Some(&json!(2)));
        assert_eq!(settled_value(&[]), None);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tessera_core::{new_entity_id, ContextMetadata, ContextType};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_merge_contains_every_key(
            objects in proptest::collection::vec(
                proptest::collection::btree_map("[a-d]", 0i64..10, 1..4),
                2..5,
            )
        ) {
            let proposals: Vec<ProposedChange> = objects
                .iter()
                .enumerate()
                .map(|(i, obj)| {
                    let mut p = ProposedChange::new(new_entity_id(), "f", json!(obj));
                    p.sequence = i as u64 + 1;
                    p
                })
                .collect();
            let record = ConflictRecord::new(new_entity_id(), "f", ConflictType::FieldModification, proposals);
            let merged = shallow_merge(&record).value;
            let merged = merged.as_object().unwrap();
            for obj in &objects {
                for key in obj.keys() {
                    prop_assert!(merged.contains_key(key));
                }
            }
            // First proposal wins every key it carries.
            for (key, value) in &objects[0] {
                prop_assert_eq!(&merged[key], &json!(value));
            }
        }

        #[test]
        fn prop_one_conflict_per_disputed_field(values in proptest::collection::vec(0u8..3, 1..6)) {
            let context = Context::new(ContextType::Task, json!({ "title": "t" }), ContextMetadata::default());
            let proposals: Vec<ProposedChange> = values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let mut p = ProposedChange::new(new_entity_id(), "f", json!(v));
                    p.sequence = i as u64 + 1;
                    p
                })
                .collect();
            let found = detect_conflicts(&context, &proposals, |_| true);
            let distinct = values.iter().collect::<std::collections::BTreeSet<_>>().len();
            prop_assert_eq!(found.len(), usize::from(distinct > 1));
        }
    }
}
