//! Error types shared by the planner, assignment engine and runtime.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by dispatch operations.
///
/// Only malformed input, registry misuse and commits that lost a race on a drone's
/// state are errors. An unreachable goal or an unassignable task is reported as a
/// normal outcome by the operation that found it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    #[error("invalid capability for drone {drone_id}: {reason}")]
    InvalidCapability { drone_id: String, reason: String },

    #[error("restricted area '{name}' is malformed: {reason}")]
    InvalidPolygon { name: String, reason: String },

    #[error("task {task_id}: emergency level {level} is outside 1..=5")]
    InvalidEmergencyLevel { task_id: u32, level: u8 },

    #[error("task {task_id}: {reason}")]
    InvalidRequirements { task_id: u32, reason: String },

    #[error("unknown drone {0}")]
    UnknownDrone(String),

    #[error("drone {0} is already registered")]
    DuplicateDrone(String),

    #[error("drone {0} is busy")]
    DroneBusy(String),

    #[error("restricted area '{0}' already exists")]
    DuplicateRestrictedArea(String),

    #[error("restricted area '{0}' not found")]
    RestrictedAreaNotFound(String),

    #[error("queue of drone {0} changed while an emergency leg was being planned")]
    QueueChanged(String),

    #[error("drone {drone_id} would be committed to {moves} moves, over its budget of {max_moves}")]
    OverBudget { drone_id: String, moves: u64, max_moves: u32 },
}

/// An emergency route is blocked by restricted airspace and needs an explicit bypass.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error(
    "task {task_id} is blocked by restricted area '{restricted_area_name}'{}",
    confirmation_note(.requires_human_confirmation)
)]
pub struct RestrictedAreaBlockage {
    pub task_id: u32,
    pub restricted_area_name: String,
    pub requires_human_confirmation: bool,
}

fn confirmation_note(required: &bool) -> &'static str {
    if *required {
        " (human confirmation required)"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blockage_message_mentions_confirmation_only_when_required() {
        let blockage = RestrictedAreaBlockage {
            task_id: 7,
            restricted_area_name: "George Square".to_string(),
            requires_human_confirmation: true,
        };
        assert_eq!(
            blockage.to_string(),
            "task 7 is blocked by restricted area 'George Square' (human confirmation required)"
        );

        let relaxed = RestrictedAreaBlockage {
            requires_human_confirmation: false,
            ..blockage
        };
        assert!(!relaxed.to_string().contains("confirmation"));
    }
}
