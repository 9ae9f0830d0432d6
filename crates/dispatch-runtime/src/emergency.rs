//! Emergency dispatch.
//!
//! Emergencies are handled one at a time, most urgent level first. Any drone able
//! to carry the payload is a candidate, busy or not; pulling a busy drone off its
//! work adds an interrupt cost to its ranking. The emergency leg is queued after
//! any earlier emergency legs and ahead of normal work, and it is planned from
//! where that earlier work leaves the drone.
//!
//! A contender is only accepted when its committed moves, the emergency leg and
//! the leg home fit its move budget.
//!
//! When restricted airspace blocks every candidate, the caller either gets a
//! [`RestrictedAreaBlockage`] back or, with `bypass` set, a route that ignores the
//! areas. A route is never flown through restricted airspace without that flag.

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use dispatch_core::spatial::{find_area_on_path, find_blocking_area};
use dispatch_core::{
    with_hover, DispatchError, DispatchRules, Drone, DroneDynamicStatus, EmergencyDispatchRecord,
    EmergencyHandleResult, FlightLeg, GeometryProvider, LegKind, PathPlanner, PlanarGeometry,
    Position, RestrictedArea, RestrictedAreaBlockage,
};

use crate::state::FleetState;

/// Times an emergency is re-ranked after losing a commit to a concurrent change.
const MAX_COMMIT_ATTEMPTS: usize = 4;

/// A drone ranked for one emergency.
#[derive(Debug, Clone)]
struct Contender {
    drone: Drone,
    service_point: Position,
    /// Where the emergency leg starts
    origin: Position,
    idle: bool,
    /// Moves already queued or in flight
    committed_moves: u64,
    /// The queue already ends with a leg home
    ends_at_home: bool,
    interrupt_cost: f64,
    estimated_moves: u64,
    rank_cost: f64,
}

/// Emergency leg and the optional leg home, checked against the move budget.
struct PlannedLegs {
    emergency: FlightLeg,
    home: Option<FlightLeg>,
}

/// A contender whose route is only possible without restricted airspace.
struct BlockedRoute {
    contender: Contender,
    legs: PlannedLegs,
}

enum Attempt {
    Done(EmergencyHandleResult),
    /// The chosen drone changed between ranking and commit
    Lost(DispatchError),
}

pub struct EmergencyDispatcher<G = PlanarGeometry> {
    state: Arc<FleetState>,
    planner: Arc<PathPlanner<G>>,
    rules: DispatchRules,
}

impl<G: GeometryProvider> EmergencyDispatcher<G> {
    pub fn new(state: Arc<FleetState>, planner: Arc<PathPlanner<G>>, rules: DispatchRules) -> Self {
        Self {
            state,
            planner,
            rules,
        }
    }

    /// Handle a batch of emergencies in ascending level order, ties in arrival order.
    ///
    /// Malformed input fails the whole call before any drone is touched.
    pub fn handle(
        &self,
        tasks: &[EmergencyDispatchRecord],
        bypass: bool,
    ) -> Result<Vec<EmergencyHandleResult>, DispatchError> {
        for task in tasks {
            task.validate()?;
        }

        let mut ordered: Vec<&EmergencyDispatchRecord> = tasks.iter().collect();
        ordered.sort_by_key(|task| task.emergency_level);

        ordered
            .into_iter()
            .map(|task| self.handle_one(task, bypass))
            .collect()
    }

    pub fn handle_one(
        &self,
        task: &EmergencyDispatchRecord,
        bypass: bool,
    ) -> Result<EmergencyHandleResult, DispatchError> {
        task.validate()?;
        let task_id = task.record.id;

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            match self.attempt(task, bypass)? {
                Attempt::Done(result) => return Ok(result),
                Attempt::Lost(reason) => {
                    debug!(task_id, attempt, reason = %reason, "Emergency commit lost, re-ranking");
                }
            }
        }

        warn!(task_id, "Emergency could not be committed to any drone");
        Ok(EmergencyHandleResult::failed(
            task_id,
            format!(
                "emergency task {} could not be committed: drone queues kept changing",
                task_id
            ),
        ))
    }

    fn attempt(&self, task: &EmergencyDispatchRecord, bypass: bool) -> Result<Attempt, DispatchError> {
        let task_id = task.record.id;
        let target = task.record.delivery;

        let contenders = self.rank(task);
        if contenders.is_empty() {
            info!(task_id, "No drone can carry emergency task");
            return Ok(Attempt::Done(EmergencyHandleResult::failed(
                task_id,
                format!("no drone meets the requirements of emergency task {}", task_id),
            )));
        }

        let areas = self.state.restricted_areas();
        let mut blocked: Option<BlockedRoute> = None;

        for contender in contenders {
            let capability = &contender.drone.capability;
            let path = self.planner.plan(contender.origin, target, &areas, capability)?;
            if !path.is_empty() {
                if let Some(legs) = self.plan_legs(task, &contender, path, &areas, false)? {
                    return self.commit(task, contender, legs, false);
                }
            }
            if blocked.is_some() {
                continue;
            }
            let free_path = self.planner.plan(contender.origin, target, &[], capability)?;
            if free_path.is_empty() {
                continue;
            }
            if let Some(legs) = self.plan_legs(task, &contender, free_path, &areas, true)? {
                debug!(task_id, drone_id = %contender.drone.id, "Emergency route blocked by restricted airspace");
                blocked = Some(BlockedRoute { contender, legs });
            }
        }

        let Some(BlockedRoute { contender, legs }) = blocked else {
            warn!(task_id, "Emergency target unreachable");
            return Ok(Attempt::Done(EmergencyHandleResult::failed(
                task_id,
                format!(
                    "emergency task {} is unreachable within move budget",
                    task_id
                ),
            )));
        };

        if bypass {
            return self.commit(task, contender, legs, true);
        }

        let geometry = self.planner.geometry();
        let restricted_area_name = find_blocking_area(geometry, contender.origin, target, &areas)
            .or_else(|| find_area_on_path(geometry, &legs.emergency.flight_path, &areas))
            .map(|area| area.name.clone())
            .unwrap_or_else(|| self.rules.unknown_area_name.clone());

        let blockage = RestrictedAreaBlockage {
            task_id,
            restricted_area_name,
            requires_human_confirmation: self.rules.requires_human_confirmation(task.emergency_level),
        };
        warn!(
            task_id,
            area = %blockage.restricted_area_name,
            confirm = blockage.requires_human_confirmation,
            "Emergency blocked by restricted area"
        );
        Ok(Attempt::Done(EmergencyHandleResult::blocked(blockage)))
    }

    /// Capable drones, cheapest first. Idle drones win ties, then drone id.
    fn rank(&self, task: &EmergencyDispatchRecord) -> Vec<Contender> {
        let hover = u64::from(self.rules.hover_moves_per_delivery);
        let target = task.record.delivery;

        let mut contenders: Vec<Contender> = self
            .state
            .candidates()
            .into_iter()
            .filter(|candidate| candidate.drone.capability.satisfies(&task.record.requirements))
            .filter_map(|candidate| {
                let status = self.state.status(&candidate.drone.id)?;
                let origin = status.emergency_origin();
                let interrupt_cost = self.interrupt_cost(&candidate.drone, &status);
                let estimated_moves = self.planner.estimate_moves(origin, target) + hover;
                let rank_cost = candidate.drone.capability.trip_cost(estimated_moves) + interrupt_cost;
                Some(Contender {
                    origin,
                    idle: !status.is_busy,
                    committed_moves: status.committed_moves(),
                    ends_at_home: status
                        .task_queue
                        .last()
                        .is_some_and(|leg| leg.kind == LegKind::Return),
                    drone: candidate.drone,
                    service_point: candidate.service_point,
                    interrupt_cost,
                    estimated_moves,
                    rank_cost,
                })
            })
            .collect();

        contenders.sort_by(|a, b| {
            a.rank_cost
                .partial_cmp(&b.rank_cost)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.idle.cmp(&a.idle))
                .then_with(|| a.drone.id.cmp(&b.drone.id))
        });
        contenders
    }

    fn interrupt_cost(&self, drone: &Drone, status: &DroneDynamicStatus) -> f64 {
        if !status.is_busy {
            return 0.0;
        }
        let legs_displaced = (status.task_queue.len() + 1) as f64;
        status.remaining_ratio()
            * drone.capability.cost_per_move
            * legs_displaced
            * self.rules.reassign_penalty_factor
    }

    /// Build the emergency leg from `path` and plan the leg home from where it ends.
    /// Returns `None` when the contender's move budget cannot cover them.
    fn plan_legs(
        &self,
        task: &EmergencyDispatchRecord,
        contender: &Contender,
        path: Vec<Position>,
        areas: &[RestrictedArea],
        bypass: bool,
    ) -> Result<Option<PlannedLegs>, DispatchError> {
        let task_id = task.record.id;
        let capability = &contender.drone.capability;

        let mut emergency = FlightLeg::new(
            LegKind::Emergency,
            Some(task_id),
            task.record.delivery,
            with_hover(path, self.rules.hover_moves_per_delivery),
        );
        emergency.emergency_level = Some(task.emergency_level);
        emergency.bypass = bypass;

        let home = if self.rules.return_to_service_point {
            let home_areas: &[RestrictedArea] = if bypass { &[] } else { areas };
            let path = self
                .planner
                .plan(emergency.end(), contender.service_point, home_areas, capability)?;
            if path.is_empty() {
                warn!(task_id, drone_id = %contender.drone.id, "No route home after emergency");
                None
            } else {
                let mut home = FlightLeg::new(LegKind::Return, None, contender.service_point, path);
                home.bypass = bypass;
                Some(home)
            }
        } else {
            None
        };

        let home_moves = match &home {
            Some(leg) if !contender.ends_at_home => leg.moves(),
            _ => 0,
        };
        let moves = contender.committed_moves + emergency.moves() + home_moves;
        if moves > u64::from(capability.max_moves) {
            debug!(
                task_id,
                drone_id = %contender.drone.id,
                moves,
                max_moves = capability.max_moves,
                "Emergency over move budget"
            );
            return Ok(None);
        }

        Ok(Some(PlannedLegs { emergency, home }))
    }

    fn commit(
        &self,
        task: &EmergencyDispatchRecord,
        contender: Contender,
        legs: PlannedLegs,
        bypassed: bool,
    ) -> Result<Attempt, DispatchError> {
        let task_id = task.record.id;
        let capability = &contender.drone.capability;
        let leg_moves = legs.emergency.moves();

        let outcome = match self.state.preempt(&contender.drone.id, legs.emergency, legs.home) {
            Ok(outcome) => outcome,
            Err(err @ (DispatchError::QueueChanged(_) | DispatchError::OverBudget { .. })) => {
                return Ok(Attempt::Lost(err));
            }
            Err(err) => return Err(err),
        };

        let base_cost = capability.trip_cost(contender.estimated_moves);
        let final_cost = capability.trip_cost(leg_moves) + contender.interrupt_cost;
        info!(
            task_id,
            drone_id = %contender.drone.id,
            level = task.emergency_level,
            queue_position = outcome.queue_position,
            was_idle = outcome.was_idle,
            bypassed,
            "Emergency dispatched"
        );

        let message = if bypassed {
            format!(
                "emergency task {} assigned to drone {} through restricted airspace",
                task_id, contender.drone.id
            )
        } else {
            format!("emergency task {} assigned to drone {}", task_id, contender.drone.id)
        };

        Ok(Attempt::Done(EmergencyHandleResult {
            task_id,
            drone_id: Some(contender.drone.id.clone()),
            final_cost,
            base_cost,
            message,
            success: true,
            bypassed,
            blockage: None,
        }))
    }
}
