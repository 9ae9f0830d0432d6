//! In-memory fleet state using DashMap.
//!
//! Each drone's runtime record sits behind its own mutex. Operations that touch a
//! drone clone its `Arc<DroneSlot>` out of the map first, so a drone lock is never
//! held together with a map shard lock or with another drone's lock.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use dispatch_core::models::AvailabilitySlot;
use dispatch_core::{
    drones_with_cooling, query_drones, DispatchError, Drone, DroneCandidate, DroneDynamicStatus,
    FlightLeg, LegKind, Position, QueryClause, RestrictedArea,
};
use uuid::Uuid;

/// Positions closer than this count as the same point when matching a leg's start.
pub const START_MATCH_TOLERANCE: f64 = 1e-12;

/// A registered drone and its live state.
pub struct DroneSlot {
    pub drone: Drone,
    pub service_point: Position,
    pub availability: Vec<AvailabilitySlot>,
    runtime: Mutex<DroneRuntime>,
}

#[derive(Debug)]
struct DroneRuntime {
    position: Position,
    queue: VecDeque<FlightLeg>,
    in_flight: Option<ActiveLeg>,
    busy: bool,
    /// cost_initial has been charged and cost_final has not
    sortie_open: bool,
    total_moves: u64,
    total_cost: f64,
    completed_legs: u64,
    abandoned_tasks: Vec<u32>,
}

#[derive(Debug, Clone)]
struct ActiveLeg {
    leg: FlightLeg,
    /// Index of the path point the drone is at
    progress: usize,
}

impl DroneSlot {
    fn lock(&self) -> MutexGuard<'_, DroneRuntime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> DroneDynamicStatus {
        self.status_of(&self.lock())
    }

    fn status_of(&self, rt: &DroneRuntime) -> DroneDynamicStatus {
        let (current_leg, remaining_leg_moves) = match &rt.in_flight {
            Some(active) => (
                Some(active.leg.clone()),
                active.leg.flight_path.len().saturating_sub(active.progress + 1) as u64,
            ),
            None => (None, 0),
        };
        DroneDynamicStatus {
            drone_id: self.drone.id.clone(),
            current_position: rt.position,
            current_leg,
            remaining_leg_moves,
            task_queue: rt.queue.iter().cloned().collect(),
            is_busy: rt.busy,
            total_moves: rt.total_moves,
            total_cost: rt.total_cost,
            completed_legs: rt.completed_legs,
            abandoned_tasks: rt.abandoned_tasks.clone(),
        }
    }

    fn complete_in_flight(&self, rt: &mut DroneRuntime) -> Option<FlightLeg> {
        let active = rt.in_flight.take()?;
        let capability = &self.drone.capability;
        let moves = active.leg.moves();

        rt.total_moves += moves;
        rt.total_cost += capability.cost_per_move * moves as f64;
        if !rt.sortie_open {
            rt.total_cost += capability.cost_initial;
            rt.sortie_open = true;
        }
        rt.completed_legs += 1;
        if rt.queue.is_empty() {
            rt.total_cost += capability.cost_final;
            rt.sortie_open = false;
            rt.busy = false;
        }
        Some(active.leg)
    }
}

/// What the executor should do with a drone after [`FleetState::start_next_leg`].
#[derive(Debug, Clone)]
pub enum LegStart {
    /// Nothing queued; the drone is idle
    Idle,
    /// A leg is already in flight
    Continuing,
    Started(FlightLeg),
}

#[derive(Debug, Clone)]
pub enum Advance {
    Idle,
    Moving { remaining_moves: u64 },
    Completed { leg: FlightLeg, drone_idle: bool },
}

#[derive(Debug, Clone, Copy)]
pub struct PreemptOutcome {
    pub was_idle: bool,
    /// Index of the emergency leg in the queue after insertion
    pub queue_position: usize,
    pub return_leg_added: bool,
}

/// Fleet state - thread-safe store for drones and restricted airspace.
pub struct FleetState {
    drones: DashMap<String, Arc<DroneSlot>>,
    restricted_areas: RwLock<Vec<RestrictedArea>>,
}

impl Default for FleetState {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetState {
    pub fn new() -> Self {
        Self {
            drones: DashMap::new(),
            restricted_areas: RwLock::new(Vec::new()),
        }
    }

    /// Register a drone parked at its service point.
    pub fn register_drone(
        &self,
        drone: Drone,
        service_point: Position,
        availability: Vec<AvailabilitySlot>,
    ) -> Result<(), DispatchError> {
        drone.validate()?;
        if !service_point.is_finite() {
            return Err(DispatchError::InvalidPosition(format!(
                "service point of drone {} is not a finite coordinate",
                drone.id
            )));
        }

        match self.drones.entry(drone.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DispatchError::DuplicateDrone(drone.id)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(DroneSlot {
                    drone,
                    service_point,
                    availability,
                    runtime: Mutex::new(DroneRuntime {
                        position: service_point,
                        queue: VecDeque::new(),
                        in_flight: None,
                        busy: false,
                        sortie_open: false,
                        total_moves: 0,
                        total_cost: 0.0,
                        completed_legs: 0,
                        abandoned_tasks: Vec::new(),
                    }),
                }));
                Ok(())
            }
        }
    }

    pub fn slot(&self, drone_id: &str) -> Option<Arc<DroneSlot>> {
        self.drones.get(drone_id).map(|entry| Arc::clone(entry.value()))
    }

    fn require(&self, drone_id: &str) -> Result<Arc<DroneSlot>, DispatchError> {
        self.slot(drone_id)
            .ok_or_else(|| DispatchError::UnknownDrone(drone_id.to_string()))
    }

    /// All slots, ordered by drone id.
    fn slots(&self) -> Vec<Arc<DroneSlot>> {
        let mut slots: Vec<Arc<DroneSlot>> =
            self.drones.iter().map(|entry| Arc::clone(entry.value())).collect();
        slots.sort_by(|a, b| a.drone.id.cmp(&b.drone.id));
        slots
    }

    pub fn drone_ids(&self) -> Vec<String> {
        self.slots().iter().map(|slot| slot.drone.id.clone()).collect()
    }

    pub fn drones(&self) -> Vec<Drone> {
        self.slots().iter().map(|slot| slot.drone.clone()).collect()
    }

    /// Point-in-time view of every drone for the assignment engine.
    ///
    /// Each drone is read under its own lock; nothing is held across drones, so the
    /// view can be stale by the time a claim is attempted.
    pub fn candidates(&self) -> Vec<DroneCandidate> {
        self.slots()
            .iter()
            .map(|slot| {
                let status = slot.snapshot();
                DroneCandidate {
                    drone: slot.drone.clone(),
                    service_point: slot.service_point,
                    position: status.next_free_position(),
                    availability: slot.availability.clone(),
                    busy: status.is_busy,
                }
            })
            .collect()
    }

    pub fn status(&self, drone_id: &str) -> Option<DroneDynamicStatus> {
        self.slot(drone_id).map(|slot| slot.snapshot())
    }

    pub fn statuses(&self) -> Vec<DroneDynamicStatus> {
        self.slots().iter().map(|slot| slot.snapshot()).collect()
    }

    pub fn all_idle(&self) -> bool {
        self.slots().iter().all(|slot| !slot.lock().busy)
    }

    /// Claim an idle drone and queue its legs in one step.
    ///
    /// Fails with [`DispatchError::DroneBusy`] if another caller got there first.
    pub fn try_claim(&self, drone_id: &str, legs: Vec<FlightLeg>) -> Result<(), DispatchError> {
        let slot = self.require(drone_id)?;
        let mut rt = slot.lock();
        if rt.busy {
            return Err(DispatchError::DroneBusy(drone_id.to_string()));
        }
        if legs.is_empty() {
            return Ok(());
        }
        rt.queue.extend(legs);
        rt.busy = true;
        Ok(())
    }

    /// Put an emergency leg ahead of all normal work queued for the drone.
    ///
    /// Earlier emergency legs keep their place. The in-flight leg is untouched, so
    /// the emergency starts at the next leg boundary. `return_leg` is queued when
    /// nothing else would bring the drone home afterwards.
    ///
    /// The leg must start at [`DroneDynamicStatus::emergency_origin`] as seen under
    /// the drone's lock, otherwise [`DispatchError::QueueChanged`] is returned. The
    /// drone's committed moves plus the new legs must fit its move budget, otherwise
    /// [`DispatchError::OverBudget`] is returned. Nothing is queued on error.
    pub fn preempt(
        &self,
        drone_id: &str,
        emergency_leg: FlightLeg,
        return_leg: Option<FlightLeg>,
    ) -> Result<PreemptOutcome, DispatchError> {
        let slot = self.require(drone_id)?;
        let mut rt = slot.lock();
        let status = slot.status_of(&rt);

        let origin = status.emergency_origin();
        let starts_at_origin = emergency_leg
            .start()
            .is_some_and(|start| start.is_close_to(&origin, START_MATCH_TOLERANCE));
        if !starts_at_origin {
            return Err(DispatchError::QueueChanged(drone_id.to_string()));
        }

        let ends_at_home = status
            .task_queue
            .last()
            .is_some_and(|leg| leg.kind == LegKind::Return);
        let return_leg = return_leg.filter(|_| !ends_at_home);

        let moves = status.committed_moves()
            + emergency_leg.moves()
            + return_leg.as_ref().map_or(0, FlightLeg::moves);
        if moves > u64::from(slot.drone.capability.max_moves) {
            return Err(DispatchError::OverBudget {
                drone_id: drone_id.to_string(),
                moves,
                max_moves: slot.drone.capability.max_moves,
            });
        }

        let was_idle = !rt.busy;
        let queue_position = rt.queue.iter().take_while(|leg| leg.is_emergency()).count();
        rt.queue.insert(queue_position, emergency_leg);
        let return_leg_added = match return_leg {
            Some(leg) => {
                rt.queue.push_back(leg);
                true
            }
            None => false,
        };
        rt.busy = true;

        Ok(PreemptOutcome {
            was_idle,
            queue_position,
            return_leg_added,
        })
    }

    /// Move the next queued leg in flight if nothing is flying.
    pub fn start_next_leg(&self, drone_id: &str) -> Result<LegStart, DispatchError> {
        let slot = self.require(drone_id)?;
        let mut rt = slot.lock();
        if rt.in_flight.is_some() {
            return Ok(LegStart::Continuing);
        }
        match rt.queue.pop_front() {
            Some(leg) => {
                rt.in_flight = Some(ActiveLeg {
                    leg: leg.clone(),
                    progress: 0,
                });
                Ok(LegStart::Started(leg))
            }
            None => {
                rt.busy = false;
                Ok(LegStart::Idle)
            }
        }
    }

    /// Swap in a re-planned path for a leg that has not moved yet.
    pub fn replace_in_flight_path(
        &self,
        drone_id: &str,
        leg_id: Uuid,
        flight_path: Vec<Position>,
    ) -> Result<bool, DispatchError> {
        let slot = self.require(drone_id)?;
        let mut rt = slot.lock();
        match rt.in_flight.as_mut() {
            Some(active) if active.leg.leg_id == leg_id && active.progress == 0 => {
                active.leg.flight_path = flight_path;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Drop an in-flight leg that cannot be flown. Its task id stays visible in the
    /// drone's status. Returns whether the drone is now idle.
    pub fn abandon_in_flight(&self, drone_id: &str, leg_id: Uuid) -> Result<bool, DispatchError> {
        let slot = self.require(drone_id)?;
        let mut rt = slot.lock();
        if rt.in_flight.as_ref().is_some_and(|active| active.leg.leg_id == leg_id) {
            if let Some(task_id) = rt.in_flight.take().and_then(|active| active.leg.task_id) {
                rt.abandoned_tasks.push(task_id);
            }
            if rt.queue.is_empty() {
                if rt.sortie_open {
                    rt.total_cost += slot.drone.capability.cost_final;
                    rt.sortie_open = false;
                }
                rt.busy = false;
            }
        }
        Ok(!rt.busy)
    }

    /// Fly up to `steps` path points of the in-flight leg.
    ///
    /// Counters change only when the leg completes.
    pub fn advance(&self, drone_id: &str, steps: usize) -> Result<Advance, DispatchError> {
        let slot = self.require(drone_id)?;
        let mut rt = slot.lock();
        let Some(active) = rt.in_flight.as_mut() else {
            return Ok(Advance::Idle);
        };

        let last = active.leg.flight_path.len().saturating_sub(1);
        active.progress = (active.progress + steps).min(last);
        let position = active.leg.flight_path.get(active.progress).copied();
        let remaining_moves = (last - active.progress) as u64;
        if let Some(position) = position {
            rt.position = position;
        }

        if remaining_moves > 0 {
            return Ok(Advance::Moving { remaining_moves });
        }

        match slot.complete_in_flight(&mut rt) {
            Some(leg) => Ok(Advance::Completed {
                leg,
                drone_idle: !rt.busy,
            }),
            None => Ok(Advance::Idle),
        }
    }

    // ========== RESTRICTED AIRSPACE ==========

    pub fn restricted_areas(&self) -> Vec<RestrictedArea> {
        self.restricted_areas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_restricted_area(&self, area: RestrictedArea) -> Result<(), DispatchError> {
        area.validate()?;
        let mut areas = self
            .restricted_areas
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if areas.iter().any(|existing| existing.name == area.name) {
            return Err(DispatchError::DuplicateRestrictedArea(area.name));
        }
        areas.push(area);
        Ok(())
    }

    pub fn remove_restricted_area(&self, name: &str) -> Result<RestrictedArea, DispatchError> {
        let mut areas = self
            .restricted_areas
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let index = areas
            .iter()
            .position(|area| area.name == name)
            .ok_or_else(|| DispatchError::RestrictedAreaNotFound(name.to_string()))?;
        Ok(areas.remove(index))
    }

    /// Remove every restricted area, returning how many there were.
    pub fn clear_restricted_areas(&self) -> usize {
        let mut areas = self
            .restricted_areas
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = areas.len();
        areas.clear();
        removed
    }

    // ========== QUERIES ==========

    pub fn query(&self, clauses: &[QueryClause]) -> Vec<String> {
        query_drones(&self.drones(), clauses)
    }

    pub fn drones_with_cooling(&self, cooling: bool) -> Vec<String> {
        drones_with_cooling(&self.drones(), cooling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::DroneCapability;

    fn drone(id: &str) -> Drone {
        Drone {
            name: id.to_uppercase(),
            id: id.to_string(),
            capability: DroneCapability {
                cooling: false,
                heating: false,
                capacity: 4.0,
                max_moves: 2000,
                cost_per_move: 0.5,
                cost_initial: 10.0,
                cost_final: 20.0,
            },
        }
    }

    fn leg(kind: LegKind, task_id: Option<u32>, points: usize) -> FlightLeg {
        leg_from(kind, task_id, 0.0, points)
    }

    /// Eastbound leg of `points` path points starting at (`start_lng`, 0).
    fn leg_from(kind: LegKind, task_id: Option<u32>, start_lng: f64, points: usize) -> FlightLeg {
        let path = (0..points)
            .map(|i| Position::new(start_lng + i as f64 * 0.00015, 0.0))
            .collect::<Vec<_>>();
        let target = path.last().copied().unwrap_or(Position::new(start_lng, 0.0));
        FlightLeg::new(kind, task_id, target, path)
    }

    fn fleet() -> FleetState {
        let state = FleetState::new();
        state
            .register_drone(drone("d1"), Position::new(0.0, 0.0), Vec::new())
            .unwrap();
        state
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let state = fleet();
        let err = state
            .register_drone(drone("d1"), Position::new(0.0, 0.0), Vec::new())
            .unwrap_err();
        assert_eq!(err, DispatchError::DuplicateDrone("d1".to_string()));
    }

    #[test]
    fn second_claim_on_busy_drone_fails() {
        let state = fleet();
        state.try_claim("d1", vec![leg(LegKind::Delivery, Some(1), 3)]).unwrap();
        let err = state
            .try_claim("d1", vec![leg(LegKind::Delivery, Some(2), 3)])
            .unwrap_err();
        assert_eq!(err, DispatchError::DroneBusy("d1".to_string()));
        assert_eq!(state.status("d1").unwrap().task_queue.len(), 1);
    }

    #[test]
    fn counters_change_only_on_completed_legs() {
        let state = fleet();
        state
            .try_claim(
                "d1",
                vec![leg(LegKind::Delivery, Some(1), 5), leg(LegKind::Return, None, 3)],
            )
            .unwrap();

        assert!(matches!(state.start_next_leg("d1").unwrap(), LegStart::Started(_)));
        assert!(matches!(
            state.advance("d1", 2).unwrap(),
            Advance::Moving { remaining_moves: 2 }
        ));
        let mid = state.status("d1").unwrap();
        assert_eq!(mid.total_moves, 0);
        assert_eq!(mid.total_cost, 0.0);
        assert_eq!(mid.remaining_leg_moves, 2);

        let done = state.advance("d1", 2).unwrap();
        assert!(matches!(done, Advance::Completed { drone_idle: false, .. }));
        let after_first = state.status("d1").unwrap();
        assert_eq!(after_first.total_moves, 4);
        assert!((after_first.total_cost - (10.0 + 4.0 * 0.5)).abs() < 1e-9);
        assert!(after_first.is_busy);

        state.start_next_leg("d1").unwrap();
        let last = state.advance("d1", 10).unwrap();
        assert!(matches!(last, Advance::Completed { drone_idle: true, .. }));

        let status = state.status("d1").unwrap();
        assert!(!status.is_busy);
        assert_eq!(status.total_moves, 6);
        assert!((status.total_cost - (10.0 + 6.0 * 0.5 + 20.0)).abs() < 1e-9);
        assert_eq!(status.completed_legs, 2);
    }

    #[test]
    fn emergency_goes_ahead_of_normal_work_but_behind_earlier_emergencies() {
        let state = fleet();
        state
            .try_claim(
                "d1",
                vec![
                    leg(LegKind::Delivery, Some(1), 3),
                    leg(LegKind::Delivery, Some(2), 3),
                    leg(LegKind::Return, None, 3),
                ],
            )
            .unwrap();
        state.start_next_leg("d1").unwrap();

        let first = state
            .preempt(
                "d1",
                leg_from(LegKind::Emergency, Some(90), 0.0003, 3),
                Some(leg(LegKind::Return, None, 2)),
            )
            .unwrap();
        let second = state
            .preempt("d1", leg_from(LegKind::Emergency, Some(91), 0.0006, 3), None)
            .unwrap();

        assert!(!first.was_idle);
        assert!(!first.return_leg_added);
        assert_eq!(first.queue_position, 0);
        assert_eq!(second.queue_position, 1);

        let status = state.status("d1").unwrap();
        assert_eq!(status.current_leg.as_ref().and_then(|l| l.task_id), Some(1));
        let order: Vec<Option<u32>> = status.task_queue.iter().map(|l| l.task_id).collect();
        assert_eq!(order, vec![Some(90), Some(91), Some(2), None]);
    }

    #[test]
    fn emergency_leg_must_start_where_earlier_emergency_ends() {
        let state = fleet();
        state
            .preempt("d1", leg(LegKind::Emergency, Some(90), 5), None)
            .unwrap();

        let err = state
            .preempt("d1", leg(LegKind::Emergency, Some(91), 3), None)
            .unwrap_err();
        assert_eq!(err, DispatchError::QueueChanged("d1".to_string()));
        assert_eq!(state.status("d1").unwrap().task_queue.len(), 1);

        state
            .preempt("d1", leg_from(LegKind::Emergency, Some(91), 0.0006, 3), None)
            .unwrap();
        assert_eq!(state.status("d1").unwrap().task_queue.len(), 2);
    }

    #[test]
    fn emergency_over_move_budget_is_rejected() {
        let state = FleetState::new();
        let mut small = drone("d1");
        small.capability.max_moves = 10;
        state
            .register_drone(small, Position::new(0.0, 0.0), Vec::new())
            .unwrap();
        state.try_claim("d1", vec![leg(LegKind::Delivery, Some(1), 5)]).unwrap();
        state.start_next_leg("d1").unwrap();

        // 4 moves in flight, 4 more out, 3 home
        let err = state
            .preempt(
                "d1",
                leg_from(LegKind::Emergency, Some(90), 0.0006, 5),
                Some(leg(LegKind::Return, None, 4)),
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::OverBudget { moves: 11, max_moves: 10, .. }));
        assert!(state.status("d1").unwrap().task_queue.is_empty());

        state
            .preempt("d1", leg_from(LegKind::Emergency, Some(90), 0.0006, 5), None)
            .unwrap();
    }

    #[test]
    fn preempting_idle_drone_queues_return_leg() {
        let state = fleet();
        let outcome = state
            .preempt("d1", leg(LegKind::Emergency, Some(7), 4), Some(leg(LegKind::Return, None, 4)))
            .unwrap();
        assert!(outcome.was_idle);
        assert!(outcome.return_leg_added);

        let status = state.status("d1").unwrap();
        assert!(status.is_busy);
        assert_eq!(status.task_queue.len(), 2);
        assert_eq!(status.task_queue[1].kind, LegKind::Return);
    }

    #[test]
    fn abandoning_last_leg_releases_drone() {
        let state = fleet();
        let only = leg(LegKind::Delivery, Some(1), 3);
        let leg_id = only.leg_id;
        state.try_claim("d1", vec![only]).unwrap();
        state.start_next_leg("d1").unwrap();

        assert!(state.abandon_in_flight("d1", leg_id).unwrap());
        let status = state.status("d1").unwrap();
        assert!(!status.is_busy);
        assert_eq!(status.total_cost, 0.0);
        assert_eq!(status.abandoned_tasks, vec![1]);
    }

    #[test]
    fn restricted_areas_are_managed_by_name() {
        let state = fleet();
        let area = RestrictedArea::new(
            "Bristo Square",
            vec![Position::new(0.0, 0.0), Position::new(1.0, 0.0), Position::new(1.0, 1.0)],
        );
        state.add_restricted_area(area.clone()).unwrap();
        assert_eq!(
            state.add_restricted_area(area).unwrap_err(),
            DispatchError::DuplicateRestrictedArea("Bristo Square".to_string())
        );
        assert_eq!(state.restricted_areas().len(), 1);

        state.remove_restricted_area("Bristo Square").unwrap();
        assert!(matches!(
            state.remove_restricted_area("Bristo Square"),
            Err(DispatchError::RestrictedAreaNotFound(_))
        ));
        assert_eq!(state.clear_restricted_areas(), 0);
    }

    #[test]
    fn unknown_drone_is_reported() {
        let state = fleet();
        assert_eq!(
            state.try_claim("ghost", Vec::new()).unwrap_err(),
            DispatchError::UnknownDrone("ghost".to_string())
        );
    }
}
