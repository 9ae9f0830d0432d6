//! Core data models for the dispatch system.
//!
//! Field names serialize in camelCase so fleet, task and restricted-area payloads
//! match the delivery data format (`maxMoves`, `costPerMove`, `emergencyLevel`, ...).

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DispatchError, RestrictedAreaBlockage};

/// A (longitude, latitude) pair, treated as a planar coordinate for routing.
///
/// Not `PartialEq`; compare with [`Position::is_close_to`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub lng: f64,
    pub lat: f64,
}

impl Position {
    pub const fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    pub fn is_finite(&self) -> bool {
        self.lng.is_finite() && self.lat.is_finite()
    }

    /// Planar distance to another position.
    pub fn planar_distance(&self, other: &Position) -> f64 {
        (self.lng - other.lng).hypot(self.lat - other.lat)
    }

    pub fn is_close_to(&self, other: &Position, tolerance: f64) -> bool {
        self.planar_distance(other) <= tolerance
    }

    pub(crate) fn validate(&self, label: &str) -> Result<(), DispatchError> {
        if self.is_finite() {
            Ok(())
        } else {
            Err(DispatchError::InvalidPosition(format!(
                "{} ({}, {}) is not a finite coordinate",
                label, self.lng, self.lat
            )))
        }
    }
}

// ========== RESTRICTED AIRSPACE ==========

/// Altitude band of a restricted area. Informational only: routing is 2D.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltitudeLimits {
    pub lower: i32,
    pub upper: i32,
}

/// A no-fly polygon. Points on its boundary count as inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictedArea {
    pub name: String,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub limits: Option<AltitudeLimits>,
    pub vertices: Vec<Position>,
}

/// Tolerance used to detect an explicitly repeated closing vertex.
const RING_CLOSURE_EPS: f64 = 1e-12;

impl RestrictedArea {
    pub fn new(name: impl Into<String>, vertices: Vec<Position>) -> Self {
        Self {
            name: name.into(),
            id: None,
            limits: None,
            vertices,
        }
    }

    /// Vertex ring without a repeated closing vertex.
    ///
    /// Source data often lists the first vertex again at the end; containment and
    /// edge tests treat the ring as implicitly closed either way.
    pub fn ring(&self) -> &[Position] {
        match (self.vertices.first(), self.vertices.last()) {
            (Some(first), Some(last))
                if self.vertices.len() > 1 && first.is_close_to(last, RING_CLOSURE_EPS) =>
            {
                &self.vertices[..self.vertices.len() - 1]
            }
            _ => &self.vertices,
        }
    }

    /// Validate the polygon. Returns list of validation errors (empty = valid).
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.ring().len() < 3 {
            errors.push(format!(
                "polygon must have at least 3 distinct vertices, got {}",
                self.ring().len()
            ));
        }
        if self.vertices.iter().any(|v| !v.is_finite()) {
            errors.push("polygon has a non-finite vertex".to_string());
        }

        errors
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::InvalidPolygon {
                name: self.name.clone(),
                reason: errors.join("; "),
            })
        }
    }

    /// Axis-aligned bounds as (min_lng, min_lat, max_lng, max_lat).
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        self.vertices.iter().fold(
            (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
            |(min_x, min_y, max_x, max_y), v| {
                (min_x.min(v.lng), min_y.min(v.lat), max_x.max(v.lng), max_y.max(v.lat))
            },
        )
    }
}

// ========== FLEET ==========

/// Static per-drone attributes governing eligibility and per-move economics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneCapability {
    #[serde(default)]
    pub cooling: bool,
    #[serde(default)]
    pub heating: bool,
    pub capacity: f64,
    /// Move budget for a single sortie
    pub max_moves: u32,
    pub cost_per_move: f64,
    pub cost_initial: f64,
    pub cost_final: f64,
}

impl DroneCapability {
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_moves == 0 {
            errors.push("maxMoves must be positive".to_string());
        }
        for (label, value) in [
            ("capacity", self.capacity),
            ("costPerMove", self.cost_per_move),
            ("costInitial", self.cost_initial),
            ("costFinal", self.cost_final),
        ] {
            if !value.is_finite() || value < 0.0 {
                errors.push(format!("{} must be a non-negative number, got {}", label, value));
            }
        }
        errors
    }

    pub fn validate(&self, drone_id: &str) -> Result<(), DispatchError> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::InvalidCapability {
                drone_id: drone_id.to_string(),
                reason: errors.join("; "),
            })
        }
    }

    /// Total cost of a sortie flying `moves` moves.
    pub fn trip_cost(&self, moves: u64) -> f64 {
        self.cost_initial + self.cost_per_move * moves as f64 + self.cost_final
    }

    /// Temperature and payload match. Busy state and availability are checked elsewhere.
    pub fn satisfies(&self, requirements: &Requirements) -> bool {
        self.capacity >= requirements.capacity
            && (!requirements.cooling || self.cooling)
            && (!requirements.heating || self.heating)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drone {
    pub name: String,
    pub id: String,
    pub capability: DroneCapability,
}

impl Drone {
    pub fn validate(&self) -> Result<(), DispatchError> {
        self.capability.validate(&self.id)
    }
}

/// A depot a drone launches from and returns to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePoint {
    pub name: String,
    pub id: u32,
    pub location: Position,
}

/// A weekly window during which a drone can be dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySlot {
    pub day_of_week: Weekday,
    pub from: NaiveTime,
    pub until: NaiveTime,
}

impl AvailabilitySlot {
    pub fn covers(&self, day: Weekday, time: Option<NaiveTime>) -> bool {
        self.day_of_week == day && time.map_or(true, |t| t >= self.from && t <= self.until)
    }
}

/// Whether a drone with the given slots may serve a task requested at `date`/`time`.
///
/// A drone without slots is always available, and a task without a date skips the check.
pub fn is_available(slots: &[AvailabilitySlot], date: Option<NaiveDate>, time: Option<NaiveTime>) -> bool {
    match date {
        None => true,
        Some(_) if slots.is_empty() => true,
        Some(date) => slots.iter().any(|slot| slot.covers(date.weekday(), time)),
    }
}

/// Which drones a service point hosts, with their availability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneForServicePoint {
    pub service_point_id: u32,
    pub drones: Vec<DroneAvailability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneAvailability {
    pub id: String,
    #[serde(default)]
    pub availability: Vec<AvailabilitySlot>,
}

// ========== TASKS ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirements {
    pub capacity: f64,
    #[serde(default)]
    pub cooling: bool,
    #[serde(default)]
    pub heating: bool,
    /// Absent, zero or negative means the task has no cost ceiling.
    #[serde(default)]
    pub max_cost: Option<f64>,
}

impl Requirements {
    pub fn budget(&self) -> Option<f64> {
        self.max_cost.filter(|cost| *cost > 0.0)
    }

    pub fn needs_temperature_control(&self) -> bool {
        self.cooling || self.heating
    }
}

/// A delivery task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRecord {
    pub id: u32,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub time: Option<NaiveTime>,
    pub requirements: Requirements,
    pub delivery: Position,
}

impl DispatchRecord {
    pub fn validate(&self) -> Result<(), DispatchError> {
        let req = &self.requirements;
        if !req.capacity.is_finite() || req.capacity < 0.0 {
            return Err(DispatchError::InvalidRequirements {
                task_id: self.id,
                reason: format!("capacity must be a non-negative number, got {}", req.capacity),
            });
        }
        if req.max_cost.is_some_and(|cost| !cost.is_finite()) {
            return Err(DispatchError::InvalidRequirements {
                task_id: self.id,
                reason: "maxCost must be finite".to_string(),
            });
        }
        self.delivery.validate(&format!("delivery of task {}", self.id))
    }
}

pub const HIGHEST_EMERGENCY_LEVEL: u8 = 1;
pub const LOWEST_EMERGENCY_LEVEL: u8 = 5;

/// A delivery task with an emergency priority (1 = highest).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyDispatchRecord {
    #[serde(flatten)]
    pub record: DispatchRecord,
    pub emergency_level: u8,
}

impl EmergencyDispatchRecord {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if !(HIGHEST_EMERGENCY_LEVEL..=LOWEST_EMERGENCY_LEVEL).contains(&self.emergency_level) {
            return Err(DispatchError::InvalidEmergencyLevel {
                task_id: self.record.id,
                level: self.emergency_level,
            });
        }
        self.record.validate()
    }
}

/// A batch of tasks one drone serves in a single sortie from its service point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneAssignment {
    pub drone: Drone,
    pub tasks: Vec<DispatchRecord>,
    pub service_point: Position,
    /// Distance-based estimate for the whole sortie, return hop included
    pub projected_moves: u64,
    pub projected_cost: f64,
}

// ========== FLIGHT LEGS ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegKind {
    Delivery,
    Emergency,
    Return,
}

/// One planned hop of a sortie.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightLeg {
    pub leg_id: Uuid,
    /// None for a return to the service point
    pub task_id: Option<u32>,
    pub kind: LegKind,
    pub target: Position,
    pub flight_path: Vec<Position>,
    #[serde(default)]
    pub emergency_level: Option<u8>,
    /// Planned through restricted airspace under an explicit bypass
    #[serde(default)]
    pub bypass: bool,
}

impl FlightLeg {
    pub fn new(kind: LegKind, task_id: Option<u32>, target: Position, flight_path: Vec<Position>) -> Self {
        Self {
            leg_id: Uuid::new_v4(),
            task_id,
            kind,
            target,
            flight_path,
            emergency_level: None,
            bypass: false,
        }
    }

    /// Moves flown along this leg, the hover move included.
    pub fn moves(&self) -> u64 {
        self.flight_path.len().saturating_sub(1) as u64
    }

    pub fn start(&self) -> Option<Position> {
        self.flight_path.first().copied()
    }

    /// Where the drone actually stops, which can be a little short of `target`.
    pub fn end(&self) -> Position {
        self.flight_path.last().copied().unwrap_or(self.target)
    }

    pub fn is_emergency(&self) -> bool {
        self.kind == LegKind::Emergency
    }
}

// ========== RUNTIME SNAPSHOTS ==========

/// Read-only copy of one drone's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DroneDynamicStatus {
    pub drone_id: String,
    pub current_position: Position,
    pub current_leg: Option<FlightLeg>,
    /// Moves left on the in-flight leg
    pub remaining_leg_moves: u64,
    pub task_queue: Vec<FlightLeg>,
    pub is_busy: bool,
    pub total_moves: u64,
    pub total_cost: f64,
    pub completed_legs: u64,
    /// Tasks whose legs were dropped because no route could be re-planned
    #[serde(default)]
    pub abandoned_tasks: Vec<u32>,
}

impl DroneDynamicStatus {
    /// Where the drone will be once the in-flight leg ends.
    pub fn next_free_position(&self) -> Position {
        self.current_leg
            .as_ref()
            .map(FlightLeg::end)
            .unwrap_or(self.current_position)
    }

    /// Where a newly queued emergency leg will start: the end of the last queued
    /// emergency leg, else the end of the in-flight leg.
    pub fn emergency_origin(&self) -> Position {
        self.task_queue
            .iter()
            .take_while(|leg| leg.is_emergency())
            .last()
            .map(FlightLeg::end)
            .unwrap_or_else(|| self.next_free_position())
    }

    /// Moves the drone is already committed to: the rest of the in-flight leg and
    /// every queued leg.
    pub fn committed_moves(&self) -> u64 {
        self.remaining_leg_moves + self.task_queue.iter().map(FlightLeg::moves).sum::<u64>()
    }

    /// Fraction of the in-flight leg still to fly, 0.0 when nothing is in flight.
    pub fn remaining_ratio(&self) -> f64 {
        match &self.current_leg {
            Some(leg) if leg.moves() > 0 => self.remaining_leg_moves as f64 / leg.moves() as f64,
            _ => 0.0,
        }
    }
}

/// Outcome of one emergency task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyHandleResult {
    pub task_id: u32,
    pub drone_id: Option<String>,
    pub final_cost: f64,
    pub base_cost: f64,
    pub message: String,
    pub success: bool,
    #[serde(default)]
    pub bypassed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockage: Option<RestrictedAreaBlockage>,
}

impl EmergencyHandleResult {
    pub fn failed(task_id: u32, message: impl Into<String>) -> Self {
        Self {
            task_id,
            drone_id: None,
            final_cost: 0.0,
            base_cost: 0.0,
            message: message.into(),
            success: false,
            bypassed: false,
            blockage: None,
        }
    }

    pub fn blocked(blockage: RestrictedAreaBlockage) -> Self {
        Self {
            blockage: Some(blockage.clone()),
            ..Self::failed(blockage.task_id, blockage.to_string())
        }
    }
}
