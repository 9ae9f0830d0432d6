//! Normal dispatch: assign tasks, route each batch, claim the drone.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use dispatch_core::{
    route_assignment, AssignmentEngine, DispatchError, DispatchRecord, DispatchRules,
    DroneAssignment, DroneCapability, GeometryProvider, PathPlanner, PlanarGeometry, Position,
    RestrictedArea, RouteError, RoutedAssignment, UnassignableReason, UnassignableTask,
};

use crate::state::FleetState;

/// Outcome of one [`Dispatcher::assign`] call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub assignments: Vec<RoutedAssignment>,
    pub unassignable: Vec<UnassignableTask>,
    pub total_moves: u64,
    pub total_cost: f64,
}

impl DispatchReport {
    fn record(&mut self, routed: RoutedAssignment) {
        self.total_moves += routed.total_moves;
        self.total_cost += routed.total_cost;
        self.assignments.push(routed);
    }

    /// The claimed sorties and `areas` as a GeoJSON `FeatureCollection`.
    pub fn to_geojson(&self, areas: &[RestrictedArea]) -> Value {
        dispatch_core::geojson::feature_collection(&self.assignments, areas)
    }
}

pub struct Dispatcher<G = PlanarGeometry> {
    state: Arc<FleetState>,
    planner: Arc<PathPlanner<G>>,
    engine: AssignmentEngine,
}

impl<G: GeometryProvider> Dispatcher<G> {
    pub fn new(state: Arc<FleetState>, planner: Arc<PathPlanner<G>>, rules: DispatchRules) -> Self {
        Self {
            state,
            planner,
            engine: AssignmentEngine::new(rules),
        }
    }

    pub fn rules(&self) -> &DispatchRules {
        self.engine.rules()
    }

    /// Plan a path against the restricted areas currently registered.
    pub fn plan_path(
        &self,
        start: Position,
        goal: Position,
        capability: &DroneCapability,
    ) -> Result<Vec<Position>, DispatchError> {
        let areas = self.state.restricted_areas();
        self.planner.plan(start, goal, &areas, capability)
    }

    /// Assign `tasks` to idle drones and queue the resulting legs.
    ///
    /// A drone that another caller claims between planning and claiming is left out
    /// and its tasks go through assignment again. A task whose legs cannot be routed
    /// is reported as unassignable and the rest of its batch is routed without it.
    pub fn assign(&self, tasks: &[DispatchRecord]) -> Result<DispatchReport, DispatchError> {
        for task in tasks {
            task.validate()?;
        }

        let mut report = DispatchReport::default();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut pending: Vec<DispatchRecord> = tasks.to_vec();

        while !pending.is_empty() {
            let candidates: Vec<_> = self
                .state
                .candidates()
                .into_iter()
                .filter(|candidate| !excluded.contains(&candidate.drone.id))
                .collect();

            let plan = self.engine.plan(self.planner.as_ref(), &pending, &candidates)?;
            pending.clear();
            for task in &plan.unassignable {
                debug!(task_id = task.task_id, reason = %task.reason, "Task unassignable");
            }
            report.unassignable.extend(plan.unassignable);

            let areas = self.state.restricted_areas();
            for assignment in plan.assignments {
                let drone_id = assignment.drone.id.clone();
                if let Some(lost) = self.route_and_claim(assignment, &areas, &mut report)? {
                    warn!(drone_id = %drone_id, tasks = lost.len(), "Drone claimed elsewhere, re-planning its tasks");
                    excluded.insert(drone_id);
                    pending.extend(lost);
                }
            }
        }

        report.unassignable.sort_by_key(|task| task.task_id);
        Ok(report)
    }

    /// Route one batch and claim its drone. Returns the tasks to re-plan if the
    /// drone turned out to be busy.
    fn route_and_claim(
        &self,
        mut assignment: DroneAssignment,
        areas: &[RestrictedArea],
        report: &mut DispatchReport,
    ) -> Result<Option<Vec<DispatchRecord>>, DispatchError> {
        let drone_id = assignment.drone.id.clone();
        let origin = match self.state.status(&drone_id) {
            Some(status) => status.next_free_position(),
            None => return Err(DispatchError::UnknownDrone(drone_id)),
        };

        while !assignment.tasks.is_empty() {
            match route_assignment(self.planner.as_ref(), &assignment, origin, areas, self.engine.rules()) {
                Ok(routed) => {
                    return match self.state.try_claim(&drone_id, routed.legs.clone()) {
                        Ok(()) => {
                            info!(
                                drone_id = %drone_id,
                                tasks = ?routed.task_ids(),
                                moves = routed.total_moves,
                                cost = routed.total_cost,
                                "Assignment claimed"
                            );
                            report.record(routed);
                            Ok(None)
                        }
                        Err(DispatchError::DroneBusy(_)) => Ok(Some(assignment.tasks)),
                        Err(err) => Err(err),
                    };
                }
                Err(RouteError::Invalid(err)) => return Err(err),
                Err(err) => {
                    let Some(task_id) = err.task_id() else {
                        return Ok(None);
                    };
                    warn!(drone_id = %drone_id, task_id, error = %err, "Routing failed");
                    report.unassignable.push(UnassignableTask {
                        task_id,
                        reason: UnassignableReason::RoutingFailed {
                            detail: err.to_string(),
                        },
                    });
                    assignment.tasks.retain(|task| task.id != task_id);
                }
            }
        }

        Ok(None)
    }
}
