//! Batch lifecycle state machine.
//!
//! ```text
//! open ──begin──▶ committing ──complete──▶ complete
//!  ▲                 │  │
//!  └──release_dry_run┘  └──fail──▶ failed ──reopen (external)──▶ open
//! ```
//!
//! A [`Transition`] can only be obtained for an edge in the table above, so
//! store adapters never see an illegal pair.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Lifecycle state of a change batch, stored in the `state` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Open,
    Committing,
    Complete,
    Failed,
}

impl BatchState {
    /// Column value as stored in the row store.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Open => "open",
            BatchState::Committing => "committing",
            BatchState::Complete => "complete",
            BatchState::Failed => "failed",
        }
    }

    /// `complete` batches are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Complete)
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(BatchState::Open),
            "committing" => Ok(BatchState::Committing),
            "complete" => Ok(BatchState::Complete),
            "failed" => Ok(BatchState::Failed),
            other => Err(StorageError::Serialization(format!(
                "unknown batch state: {other}"
            ))),
        }
    }
}

/// A legal edge of the batch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transition {
    from: BatchState,
    to: BatchState,
}

impl Transition {
    /// Claim an open batch for a commit run.
    pub const BEGIN: Transition = Transition {
        from: BatchState::Open,
        to: BatchState::Committing,
    };

    /// Hand a batch back after a dry run.
    pub const RELEASE_DRY_RUN: Transition = Transition {
        from: BatchState::Committing,
        to: BatchState::Open,
    };

    /// Record a landed commit.
    pub const COMPLETE: Transition = Transition {
        from: BatchState::Committing,
        to: BatchState::Complete,
    };

    /// Record a terminal failure.
    pub const FAIL: Transition = Transition {
        from: BatchState::Committing,
        to: BatchState::Failed,
    };

    /// Retry a failed batch. Only ever issued by an operator, never by the
    /// orchestrator.
    pub const REOPEN: Transition = Transition {
        from: BatchState::Failed,
        to: BatchState::Open,
    };

    const TABLE: [Transition; 5] = [
        Transition::BEGIN,
        Transition::RELEASE_DRY_RUN,
        Transition::COMPLETE,
        Transition::FAIL,
        Transition::REOPEN,
    ];

    /// Look up the edge `from -> to`, rejecting pairs outside the table.
    pub fn new(from: BatchState, to: BatchState) -> Result<Self, StorageError> {
        Self::TABLE
            .iter()
            .copied()
            .find(|t| t.from == from && t.to == to)
            .ok_or(StorageError::IllegalTransition { from, to })
    }

    pub fn from(&self) -> BatchState {
        self.from
    }

    pub fn to(&self) -> BatchState {
        self.to
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [BatchState; 4] = [
        BatchState::Open,
        BatchState::Committing,
        BatchState::Complete,
        BatchState::Failed,
    ];

    #[test]
    fn table_has_exactly_five_edges() {
        let legal = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| Transition::new(*from, *to).is_ok())
            .count();
        assert_eq!(legal, 5);
    }

    #[test]
    fn complete_is_immutable() {
        for to in ALL {
            assert!(Transition::new(BatchState::Complete, to).is_err());
        }
        assert!(BatchState::Complete.is_terminal());
    }

    #[test]
    fn open_cannot_skip_committing() {
        let err = Transition::new(BatchState::Open, BatchState::Complete).unwrap_err();
        assert!(matches!(
            err,
            StorageError::IllegalTransition {
                from: BatchState::Open,
                to: BatchState::Complete
            }
        ));
        assert!(Transition::new(BatchState::Open, BatchState::Failed).is_err());
    }

    #[test]
    fn constants_match_lookup() {
        assert_eq!(
            Transition::new(BatchState::Committing, BatchState::Failed).unwrap(),
            Transition::FAIL
        );
        assert_eq!(Transition::REOPEN.from(), BatchState::Failed);
        assert_eq!(Transition::REOPEN.to(), BatchState::Open);
    }

    #[test]
    fn state_column_values_round_trip() {
        for state in ALL {
            let parsed: BatchState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
        assert!("archived".parse::<BatchState>().is_err());
    }
}
