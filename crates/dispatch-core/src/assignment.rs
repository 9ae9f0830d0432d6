//! Assignment engine: matches pending tasks to drones by capability, capacity,
//! availability and projected cost.
//!
//! Tasks are considered one at a time in priority order. Each task goes to the
//! eligible drone with the lowest projected cost for it, and may join a batch the
//! drone already holds as long as the summed payload and the estimated round trip
//! still fit the drone. The projection uses the straight-line move estimate; legs
//! are planned for real only once a batch is routed.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

use crate::error::DispatchError;
use crate::models::{
    is_available, AvailabilitySlot, DispatchRecord, Drone, DroneAssignment, Position,
};
use crate::route_engine::PathPlanner;
use crate::rules::DispatchRules;
use crate::spatial::GeometryProvider;

/// A drone as seen by the assignment engine at planning time.
#[derive(Debug, Clone)]
pub struct DroneCandidate {
    pub drone: Drone,
    pub service_point: Position,
    pub position: Position,
    pub availability: Vec<AvailabilitySlot>,
    pub busy: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnassignableReason {
    #[error("no idle drone meets the requirements")]
    NoEligibleDrone,

    #[error("cheapest projected cost {best_cost:.2} exceeds maxCost {max_cost:.2}")]
    OverBudget { best_cost: f64, max_cost: f64 },

    #[error("{detail}")]
    RoutingFailed { detail: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnassignableTask {
    pub task_id: u32,
    pub reason: UnassignableReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentPlan {
    pub assignments: Vec<DroneAssignment>,
    pub unassignable: Vec<UnassignableTask>,
}

/// Tasks a drone has collected so far in this planning pass.
struct Batch<'a> {
    tasks: Vec<&'a DispatchRecord>,
    load: f64,
    tour_end: Position,
    outbound_moves: u64,
}

#[derive(Debug, Clone, Copy)]
struct Projection {
    task_cost: f64,
    outbound_moves: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentEngine {
    rules: DispatchRules,
}

impl AssignmentEngine {
    pub fn new(rules: DispatchRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &DispatchRules {
        &self.rules
    }

    /// Assign `tasks` to `candidates`.
    ///
    /// Fails only on malformed input; a task that cannot be placed is listed in
    /// [`AssignmentPlan::unassignable`] and the rest of the batch carries on.
    pub fn plan<G: GeometryProvider>(
        &self,
        planner: &PathPlanner<G>,
        tasks: &[DispatchRecord],
        candidates: &[DroneCandidate],
    ) -> Result<AssignmentPlan, DispatchError> {
        for task in tasks {
            task.validate()?;
        }
        for candidate in candidates {
            candidate.drone.validate()?;
        }

        let mut batches: Vec<Batch<'_>> = candidates
            .iter()
            .map(|c| Batch {
                tasks: Vec::new(),
                load: 0.0,
                tour_end: c.position,
                outbound_moves: 0,
            })
            .collect();
        let mut unassignable = Vec::new();

        for task in priority_order(tasks) {
            let mut best: Option<(usize, Projection)> = None;
            for (index, candidate) in candidates.iter().enumerate() {
                let batch = &batches[index];
                if !self.is_eligible(candidate, batch, task) {
                    continue;
                }
                let Some(projection) = self.project(planner, candidate, batch, task) else {
                    continue;
                };
                // Strictly cheaper wins, so ties stay with the earlier candidate.
                let better = best
                    .as_ref()
                    .map_or(true, |(_, current)| projection.task_cost < current.task_cost);
                if better {
                    best = Some((index, projection));
                }
            }

            let Some((index, projection)) = best else {
                unassignable.push(UnassignableTask {
                    task_id: task.id,
                    reason: UnassignableReason::NoEligibleDrone,
                });
                continue;
            };

            if let Some(max_cost) = task.requirements.budget() {
                if projection.task_cost > max_cost {
                    unassignable.push(UnassignableTask {
                        task_id: task.id,
                        reason: UnassignableReason::OverBudget {
                            best_cost: projection.task_cost,
                            max_cost,
                        },
                    });
                    continue;
                }
            }

            let batch = &mut batches[index];
            batch.tasks.push(task);
            batch.load += task.requirements.capacity;
            batch.tour_end = task.delivery;
            batch.outbound_moves = projection.outbound_moves;
        }

        let assignments = candidates
            .iter()
            .zip(batches)
            .filter(|(_, batch)| !batch.tasks.is_empty())
            .map(|(candidate, batch)| {
                let projected_moves =
                    batch.outbound_moves + self.return_moves(planner, batch.tour_end, candidate);
                DroneAssignment {
                    drone: candidate.drone.clone(),
                    tasks: batch.tasks.into_iter().cloned().collect(),
                    service_point: candidate.service_point,
                    projected_moves,
                    projected_cost: candidate.drone.capability.trip_cost(projected_moves),
                }
            })
            .collect();

        Ok(AssignmentPlan {
            assignments,
            unassignable,
        })
    }

    fn is_eligible(&self, candidate: &DroneCandidate, batch: &Batch<'_>, task: &DispatchRecord) -> bool {
        let capability = &candidate.drone.capability;
        let same_day = batch.tasks.first().map_or(true, |first| first.date == task.date);

        !candidate.busy
            && capability.satisfies(&task.requirements)
            && batch.load + task.requirements.capacity <= capability.capacity
            && same_day
            && is_available(&candidate.availability, task.date, task.time)
    }

    /// Projected cost of adding `task` to the candidate's batch, or None if the
    /// round trip would no longer fit the move budget.
    fn project<G: GeometryProvider>(
        &self,
        planner: &PathPlanner<G>,
        candidate: &DroneCandidate,
        batch: &Batch<'_>,
        task: &DispatchRecord,
    ) -> Option<Projection> {
        let capability = &candidate.drone.capability;
        let hover = u64::from(self.rules.hover_moves_per_delivery);

        let outbound_moves =
            batch.outbound_moves + planner.estimate_moves(batch.tour_end, task.delivery) + hover;
        let sortie_moves = outbound_moves + self.return_moves(planner, task.delivery, candidate);
        if sortie_moves > u64::from(capability.max_moves) {
            return None;
        }

        let previous_sortie = if batch.tasks.is_empty() {
            0
        } else {
            batch.outbound_moves + self.return_moves(planner, batch.tour_end, candidate)
        };
        let marginal_moves = sortie_moves.saturating_sub(previous_sortie);
        let sharing = (batch.tasks.len() + 1) as f64;

        Some(Projection {
            task_cost: (capability.cost_initial + capability.cost_final) / sharing
                + capability.cost_per_move * marginal_moves as f64,
            outbound_moves,
        })
    }

    fn return_moves<G: GeometryProvider>(
        &self,
        planner: &PathPlanner<G>,
        from: Position,
        candidate: &DroneCandidate,
    ) -> u64 {
        if self.rules.return_to_service_point {
            planner.estimate_moves(from, candidate.service_point)
        } else {
            0
        }
    }
}

/// Temperature-controlled tasks first, then heavier payloads, then task id.
fn priority_order(tasks: &[DispatchRecord]) -> Vec<&DispatchRecord> {
    let mut ordered: Vec<&DispatchRecord> = tasks.iter().collect();
    ordered.sort_by(|a, b| {
        b.requirements
            .needs_temperature_control()
            .cmp(&a.requirements.needs_temperature_control())
            .then_with(|| {
                b.requirements
                    .capacity
                    .partial_cmp(&a.requirements.capacity)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    ordered
}
