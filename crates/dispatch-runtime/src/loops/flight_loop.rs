//! Flight execution loop.
//!
//! Starts queued legs and advances every drone along its in-flight leg each tick.
//! Leg completion is the only point where a drone's counters change.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};

use dispatch_core::{
    with_hover, DispatchError, DispatchRules, FlightLeg, GeometryProvider, LegKind, PathPlanner,
    PlanarGeometry,
};

use crate::state::{Advance, FleetState, LegStart, START_MATCH_TOLERANCE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub started: usize,
    pub replanned: usize,
    pub abandoned: usize,
    pub moving: usize,
    pub completed: usize,
}

impl TickSummary {
    pub fn is_quiet(&self) -> bool {
        *self == TickSummary::default()
    }
}

pub struct FlightExecutor<G = PlanarGeometry> {
    state: Arc<FleetState>,
    planner: Arc<PathPlanner<G>>,
    rules: DispatchRules,
    moves_per_tick: usize,
}

impl<G: GeometryProvider> FlightExecutor<G> {
    pub fn new(
        state: Arc<FleetState>,
        planner: Arc<PathPlanner<G>>,
        rules: DispatchRules,
        moves_per_tick: usize,
    ) -> Self {
        Self {
            state,
            planner,
            rules,
            moves_per_tick: moves_per_tick.max(1),
        }
    }

    pub fn state(&self) -> &Arc<FleetState> {
        &self.state
    }

    /// One step of the whole fleet. Drones are handled one at a time, each under
    /// its own lock.
    pub fn tick(&self) -> Result<TickSummary, DispatchError> {
        let mut summary = TickSummary::default();

        for drone_id in self.state.drone_ids() {
            match self.state.start_next_leg(&drone_id)? {
                LegStart::Idle => continue,
                LegStart::Continuing => {}
                LegStart::Started(leg) => {
                    summary.started += 1;
                    tracing::debug!(drone_id = %drone_id, leg_id = %leg.leg_id, kind = ?leg.kind, "Leg started");
                    match self.ensure_leg_start(&drone_id, &leg)? {
                        StartCheck::Ready => {}
                        StartCheck::Replanned => summary.replanned += 1,
                        StartCheck::Abandoned => {
                            summary.abandoned += 1;
                            continue;
                        }
                    }
                }
            }

            match self.state.advance(&drone_id, self.moves_per_tick)? {
                Advance::Idle => {}
                Advance::Moving { .. } => summary.moving += 1,
                Advance::Completed { leg, drone_idle } => {
                    summary.completed += 1;
                    tracing::info!(
                        drone_id = %drone_id,
                        leg_id = %leg.leg_id,
                        task_id = ?leg.task_id,
                        moves = leg.moves(),
                        drone_idle,
                        "Leg completed"
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Re-plan a freshly started leg whose path does not begin where the drone is.
    fn ensure_leg_start(&self, drone_id: &str, leg: &FlightLeg) -> Result<StartCheck, DispatchError> {
        let Some(slot) = self.state.slot(drone_id) else {
            return Err(DispatchError::UnknownDrone(drone_id.to_string()));
        };
        let Some(status) = self.state.status(drone_id) else {
            return Err(DispatchError::UnknownDrone(drone_id.to_string()));
        };
        let position = status.current_position;

        let matches = leg
            .start()
            .is_some_and(|start| start.is_close_to(&position, START_MATCH_TOLERANCE));
        if matches {
            return Ok(StartCheck::Ready);
        }

        let areas = if leg.bypass {
            Vec::new()
        } else {
            self.state.restricted_areas()
        };
        let path = self
            .planner
            .plan(position, leg.target, &areas, &slot.drone.capability)?;

        if path.is_empty() {
            if leg.is_emergency() {
                tracing::error!(
                    drone_id = %drone_id,
                    leg_id = %leg.leg_id,
                    task_id = ?leg.task_id,
                    level = ?leg.emergency_level,
                    "Emergency leg cannot be re-planned from current position, abandoning"
                );
            } else {
                tracing::warn!(
                    drone_id = %drone_id,
                    leg_id = %leg.leg_id,
                    task_id = ?leg.task_id,
                    "Leg cannot be re-planned from current position, abandoning"
                );
            }
            self.state.abandon_in_flight(drone_id, leg.leg_id)?;
            return Ok(StartCheck::Abandoned);
        }

        let path = match leg.kind {
            LegKind::Delivery | LegKind::Emergency => with_hover(path, self.rules.hover_moves_per_delivery),
            LegKind::Return => path,
        };
        self.state.replace_in_flight_path(drone_id, leg.leg_id, path)?;
        tracing::debug!(drone_id = %drone_id, leg_id = %leg.leg_id, "Leg re-planned");
        Ok(StartCheck::Replanned)
    }
}

enum StartCheck {
    Ready,
    Replanned,
    Abandoned,
}

async fn tick_blocking<G: GeometryProvider + 'static>(
    executor: &Arc<FlightExecutor<G>>,
) -> Result<TickSummary> {
    let executor = Arc::clone(executor);
    let summary = tokio::task::spawn_blocking(move || executor.tick()).await??;
    Ok(summary)
}

/// Tick until every drone is idle. Fails once `max_run` has elapsed.
pub async fn run_until_idle<G: GeometryProvider + 'static>(
    executor: Arc<FlightExecutor<G>>,
    tick_interval: Duration,
    max_run: Duration,
) -> Result<u64> {
    let deadline = Instant::now() + max_run;
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = 0u64;

    while !executor.state().all_idle() {
        if Instant::now() >= deadline {
            bail!("fleet still busy after {:?} ({} ticks)", max_run, ticks);
        }
        ticker.tick().await;
        tick_blocking(&executor).await?;
        ticks += 1;
    }

    tracing::info!(ticks, "Fleet idle");
    Ok(ticks)
}

pub async fn run_flight_loop<G: GeometryProvider + 'static>(
    executor: Arc<FlightExecutor<G>>,
    tick_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("Flight loop shutting down");
                break;
            }
            _ = ticker.tick() => {
                match tick_blocking(&executor).await {
                    Ok(summary) if !summary.is_quiet() => {
                        tracing::debug!(?summary, "Flight tick");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Flight tick failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::{Drone, DroneCapability, Position, RestrictedArea};

    fn executor() -> FlightExecutor {
        let state = Arc::new(FleetState::new());
        state
            .register_drone(
                Drone {
                    name: "Runner".to_string(),
                    id: "d1".to_string(),
                    capability: DroneCapability {
                        cooling: false,
                        heating: false,
                        capacity: 4.0,
                        max_moves: 200,
                        cost_per_move: 1.0,
                        cost_initial: 5.0,
                        cost_final: 7.0,
                    },
                },
                Position::new(0.0, 0.0),
                Vec::new(),
            )
            .unwrap();
        FlightExecutor::new(state, Arc::new(PathPlanner::default()), DispatchRules::default(), 1)
    }

    fn straight(from: f64, steps: usize) -> Vec<Position> {
        (0..=steps)
            .map(|i| Position::new(from + i as f64 * 0.00015, 0.0))
            .collect()
    }

    #[test]
    fn legs_are_flown_one_point_per_tick() {
        let executor = executor();
        let leg = FlightLeg::new(LegKind::Delivery, Some(1), Position::new(0.0003, 0.0), straight(0.0, 2));
        executor.state.try_claim("d1", vec![leg]).unwrap();

        let first = executor.tick().unwrap();
        assert_eq!(first.started, 1);
        assert_eq!(first.moving, 1);
        assert_eq!(executor.state.status("d1").unwrap().total_moves, 0);

        let second = executor.tick().unwrap();
        assert_eq!(second.completed, 1);
        let status = executor.state.status("d1").unwrap();
        assert!(!status.is_busy);
        assert_eq!(status.total_moves, 2);
        assert!((status.total_cost - (5.0 + 2.0 + 7.0)).abs() < 1e-9);

        assert!(executor.tick().unwrap().is_quiet());
    }

    #[test]
    fn leg_starting_elsewhere_is_replanned_from_current_position() {
        let executor = executor();
        // Planned as if the drone were already at 0.0015.
        let leg = FlightLeg::new(LegKind::Return, None, Position::new(0.0030, 0.0), straight(0.0015, 10));
        let leg_id = leg.leg_id;
        executor.state.try_claim("d1", vec![leg]).unwrap();

        let summary = executor.tick().unwrap();
        assert_eq!(summary.replanned, 1);
        let status = executor.state.status("d1").unwrap();
        let current = status.current_leg.unwrap();
        assert_eq!(current.leg_id, leg_id);
        assert!(current.start().unwrap().is_close_to(&Position::new(0.0, 0.0), 1e-12));
    }

    #[test]
    fn leg_that_cannot_be_replanned_is_abandoned() {
        let executor = executor();
        executor
            .state
            .add_restricted_area(RestrictedArea::new(
                "hangar",
                vec![
                    Position::new(0.0025, -0.0005),
                    Position::new(0.0035, -0.0005),
                    Position::new(0.0035, 0.0005),
                    Position::new(0.0025, 0.0005),
                ],
            ))
            .unwrap();
        let leg = FlightLeg::new(LegKind::Delivery, Some(4), Position::new(0.0030, 0.0), straight(0.0015, 10));
        executor.state.try_claim("d1", vec![leg]).unwrap();

        let summary = executor.tick().unwrap();
        assert_eq!(summary.abandoned, 1);
        let status = executor.state.status("d1").unwrap();
        assert!(!status.is_busy);
        assert_eq!(status.abandoned_tasks, vec![4]);
    }

    #[tokio::test]
    async fn run_until_idle_drains_the_fleet() {
        let executor = Arc::new(executor());
        let leg = FlightLeg::new(LegKind::Delivery, Some(1), Position::new(0.0006, 0.0), straight(0.0, 4));
        executor.state.try_claim("d1", vec![leg]).unwrap();

        let ticks = run_until_idle(Arc::clone(&executor), Duration::from_millis(10), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ticks, 4);
        assert_eq!(executor.state.status("d1").unwrap().completed_legs, 1);
    }

    #[tokio::test]
    async fn flight_loop_stops_on_shutdown() {
        let executor = Arc::new(executor());
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_flight_loop(executor, Duration::from_millis(5), rx));
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
