//! Context lifecycle state machine
//!
//! The lifecycle is an explicit transition table checked by the pure function
//! [`next_state`]. Anything not in the table is rejected and leaves the state
//! untouched.

use crate::enums::{string_enum, EnumParseError};
use crate::{ContextId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// STATES AND EVENTS
// ============================================================================

/// Lifecycle state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleState {
    #[default]
    Created,
    Validating,
    Storing,
    Active,
    Accessing,
    Updating,
    Compressing,
    Archiving,
    Archived,
    Restoring,
    Deleting,
    Deleted,
    Error,
}

string_enum!(LifecycleState, "lifecycle state", {
    Created => "created",
    Validating => "validating",
    Storing => "storing",
    Active => "active",
    Accessing => "accessing",
    Updating => "updating",
    Compressing => "compressing",
    Archiving => "archiving",
    Archived => "archived",
    Restoring => "restoring",
    Deleting => "deleting",
    Deleted => "deleted",
    Error => "error",
});

impl LifecycleState {
    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Deleted)
    }

    /// States entered for the duration of a single operation.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            LifecycleState::Validating
                | LifecycleState::Storing
                | LifecycleState::Accessing
                | LifecycleState::Updating
                | LifecycleState::Compressing
                | LifecycleState::Archiving
                | LifecycleState::Restoring
                | LifecycleState::Deleting
        )
    }
}

/// Event driving a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleEvent {
    Validate,
    Store,
    Access,
    Update,
    Compress,
    Archive,
    Delete,
    Restore,
    /// The in-flight operation completed
    Succeed,
    /// The in-flight operation failed
    Fail,
    Retry,
    Abort,
}

string_enum!(LifecycleEvent, "lifecycle event", {
    Validate => "validate",
    Store => "store",
    Access => "access",
    Update => "update",
    Compress => "compress",
    Archive => "archive",
    Delete => "delete",
    Restore => "restore",
    Succeed => "succeed",
    Fail => "fail",
    Retry => "retry",
    Abort => "abort",
});

// ============================================================================
// TRANSITION TABLE
// ============================================================================

/// A transition that is not in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub from: LifecycleState,
    pub event: LifecycleEvent,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} not allowed from {}", self.event, self.from)
    }
}

impl std::error::Error for Rejected {}

/// Compute the state reached by applying `event` in `current`.
pub fn next_state(
    current: LifecycleState,
    event: LifecycleEvent,
) -> Result<LifecycleState, Rejected> {
    use LifecycleEvent as E;
    use LifecycleState as S;

    let next = match (current, event) {
        (S::Created, E::Validate) => S::Validating,
        (S::Created, E::Store) => S::Storing,

        (S::Validating, E::Succeed) => S::Storing,
        (S::Validating, E::Fail) => S::Error,

        (S::Storing, E::Succeed) => S::Active,
        (S::Storing, E::Fail) => S::Error,

        (S::Active, E::Access) => S::Accessing,
        (S::Active, E::Update) => S::Updating,
        (S::Active, E::Compress) => S::Compressing,
        (S::Active, E::Archive) => S::Archiving,
        (S::Active, E::Delete) => S::Deleting,

        (S::Accessing | S::Updating | S::Compressing, E::Succeed) => S::Active,
        (S::Accessing | S::Updating | S::Compressing, E::Fail) => S::Error,

        (S::Archiving, E::Succeed) => S::Archived,
        (S::Archiving, E::Fail) => S::Error,

        (S::Archived, E::Restore) => S::Restoring,
        (S::Archived, E::Delete) => S::Deleting,

        // A failed restore leaves the archived copy in place.
        (S::Restoring, E::Succeed) => S::Active,
        (S::Restoring, E::Fail) => S::Archived,

        (S::Deleting, E::Succeed) => S::Deleted,
        (S::Deleting, E::Fail) => S::Error,

        (S::Error, E::Retry) => S::Created,
        (S::Error, E::Abort) => S::Deleted,

        (from, event) => return Err(Rejected { from, event }),
    };
    Ok(next)
}

/// Events accepted in `state`, in declaration order.
pub fn allowed_events(state: LifecycleState) -> Vec<LifecycleEvent> {
    LifecycleEvent::all()
        .iter()
        .copied()
        .filter(|event| next_state(state, *event).is_ok())
        .collect()
}

/// A committed lifecycle transition, as emitted on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub context_id: ContextId,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub event: LifecycleEvent,
    pub at: Timestamp,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_to_active() {
        let s = next_state(LifecycleState::Created, LifecycleEvent::Validate).unwrap();
        assert_eq!(s, LifecycleState::Validating);
        let s = next_state(s, LifecycleEvent::Succeed).unwrap();
        assert_eq!(s, LifecycleState::Storing);
        let s = next_state(s, LifecycleEvent::Succeed).unwrap();
        assert_eq!(s, LifecycleState::Active);
    }

    #[test]
    fn test_archive_restore_delete() {
        let s = next_state(LifecycleState::Active, LifecycleEvent::Archive).unwrap();
        let s = next_state(s, LifecycleEvent::Succeed).unwrap();
        assert_eq!(s, LifecycleState::Archived);
        let restoring = next_state(s, LifecycleEvent::Restore).unwrap();
        assert_eq!(restoring, LifecycleState::Restoring);
        assert_eq!(
            next_state(restoring, LifecycleEvent::Succeed).unwrap(),
            LifecycleState::Active
        );
        assert_eq!(
            next_state(s, LifecycleEvent::Delete).unwrap(),
            LifecycleState::Deleting
        );
    }

    #[test]
    fn test_restoring_blocks_delete_and_falls_back_to_archived() {
        assert!(next_state(LifecycleState::Restoring, LifecycleEvent::Delete).is_err());
        assert!(next_state(LifecycleState::Restoring, LifecycleEvent::Restore).is_err());
        assert_eq!(
            next_state(LifecycleState::Restoring, LifecycleEvent::Fail).unwrap(),
            LifecycleState::Archived
        );
    }

    #[test]
    fn test_error_recovery() {
        assert_eq!(
            next_state(LifecycleState::Error, LifecycleEvent::Retry).unwrap(),
            LifecycleState::Created
        );
        assert_eq!(
            next_state(LifecycleState::Error, LifecycleEvent::Abort).unwrap(),
            LifecycleState::Deleted
        );
    }

    #[test]
    fn test_deleted_is_terminal() {
        assert!(allowed_events(LifecycleState::Deleted).is_empty());
        assert!(LifecycleState::Deleted.is_terminal());
    }

    #[test]
    fn test_rejects_update_from_created() {
        let err = next_state(LifecycleState::Created, LifecycleEvent::Update).unwrap_err();
        assert_eq!(err.from, LifecycleState::Created);
        assert_eq!(err.event, LifecycleEvent::Update);
    }

    #[test]
    fn test_active_allows_five_operations() {
        assert_eq!(
            allowed_events(LifecycleState::Active),
            vec![
                LifecycleEvent::Access,
                LifecycleEvent::Update,
                LifecycleEvent::Compress,
                LifecycleEvent::Archive,
                LifecycleEvent::Delete,
            ]
        );
    }
}
