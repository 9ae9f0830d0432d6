//! Expands a drone assignment into the legs it will fly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DispatchError;
use crate::models::{DroneAssignment, FlightLeg, LegKind, Position, RestrictedArea};
use crate::route_engine::PathPlanner;
use crate::rules::DispatchRules;
use crate::spatial::GeometryProvider;

/// An assignment with every leg planned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedAssignment {
    pub drone_id: String,
    pub service_point: Position,
    pub legs: Vec<FlightLeg>,
    pub total_moves: u64,
    pub total_cost: f64,
}

impl RoutedAssignment {
    pub fn task_ids(&self) -> Vec<u32> {
        self.legs.iter().filter_map(|leg| leg.task_id).collect()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    #[error("no path to the delivery point of task {task_id}")]
    Unreachable { task_id: u32 },

    #[error("no path back to the service point after task {task_id}")]
    ReturnUnreachable { task_id: u32 },

    #[error("task {task_id} takes the sortie to {moves} moves, over the budget of {max_moves}")]
    MoveBudgetExceeded { task_id: u32, moves: u64, max_moves: u32 },

    #[error(transparent)]
    Invalid(#[from] DispatchError),
}

impl RouteError {
    /// Task the failure is attributed to, if the routing itself failed.
    pub fn task_id(&self) -> Option<u32> {
        match self {
            RouteError::Unreachable { task_id }
            | RouteError::ReturnUnreachable { task_id }
            | RouteError::MoveBudgetExceeded { task_id, .. } => Some(*task_id),
            RouteError::Invalid(_) => None,
        }
    }
}

/// Repeat the arrival point so the drone hovers for `hover_moves` moves.
pub fn with_hover(mut path: Vec<Position>, hover_moves: u32) -> Vec<Position> {
    if let Some(last) = path.last().copied() {
        path.extend(std::iter::repeat(last).take(hover_moves as usize));
    }
    path
}

/// Plan every delivery of `assignment` in order, starting from `origin`, and the
/// leg back to the service point.
pub fn route_assignment<G: GeometryProvider>(
    planner: &PathPlanner<G>,
    assignment: &DroneAssignment,
    origin: Position,
    obstacles: &[RestrictedArea],
    rules: &DispatchRules,
) -> Result<RoutedAssignment, RouteError> {
    let capability = &assignment.drone.capability;
    let budget = u64::from(capability.max_moves);
    let mut legs = Vec::with_capacity(assignment.tasks.len() + 1);
    let mut position = origin;
    let mut moves = 0u64;

    for task in &assignment.tasks {
        let path = planner.plan(position, task.delivery, obstacles, capability)?;
        if path.is_empty() {
            return Err(RouteError::Unreachable { task_id: task.id });
        }
        let leg = FlightLeg::new(
            LegKind::Delivery,
            Some(task.id),
            task.delivery,
            with_hover(path, rules.hover_moves_per_delivery),
        );
        moves += leg.moves();
        if moves > budget {
            return Err(RouteError::MoveBudgetExceeded {
                task_id: task.id,
                moves,
                max_moves: capability.max_moves,
            });
        }
        position = leg.flight_path.last().copied().unwrap_or(task.delivery);
        legs.push(leg);
    }

    if let (true, Some(last_task)) = (rules.return_to_service_point, assignment.tasks.last()) {
        let path = planner.plan(position, assignment.service_point, obstacles, capability)?;
        if path.is_empty() {
            return Err(RouteError::ReturnUnreachable { task_id: last_task.id });
        }
        let leg = FlightLeg::new(LegKind::Return, None, assignment.service_point, path);
        moves += leg.moves();
        if moves > budget {
            return Err(RouteError::MoveBudgetExceeded {
                task_id: last_task.id,
                moves,
                max_moves: capability.max_moves,
            });
        }
        legs.push(leg);
    }

    Ok(RoutedAssignment {
        drone_id: assignment.drone.id.clone(),
        service_point: assignment.service_point,
        legs,
        total_moves: moves,
        total_cost: capability.trip_cost(moves),
    })
}
