//! Scenario files: a fleet, its airspace and a day's work, run end to end.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use dispatch_core::models::AvailabilitySlot;
use dispatch_core::{
    DispatchRecord, DispatchRules, Drone, DroneDynamicStatus, DroneForServicePoint,
    EmergencyDispatchRecord, EmergencyHandleResult, PathPlanner, Position, QueryClause,
    RestrictedArea, ServicePoint,
};

use crate::config::Config;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::emergency::EmergencyDispatcher;
use crate::loops::flight_loop::{run_until_idle, FlightExecutor};
use crate::state::FleetState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default)]
    pub service_points: Vec<ServicePoint>,
    #[serde(default)]
    pub drones: Vec<Drone>,
    #[serde(default)]
    pub drones_for_service_points: Vec<DroneForServicePoint>,
    #[serde(default)]
    pub restricted_areas: Vec<RestrictedArea>,
    #[serde(default)]
    pub dispatches: Vec<DispatchRecord>,
    #[serde(default)]
    pub emergencies: Vec<EmergencyDispatchRecord>,
    #[serde(default)]
    pub bypass_restricted_areas: bool,
    /// Each entry is one query; its clauses are combined with AND
    #[serde(default)]
    pub queries: Vec<Vec<QueryClause>>,
    #[serde(default)]
    pub rules: DispatchRules,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub clauses: Vec<QueryClause>,
    pub drone_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub dispatch: DispatchReport,
    pub emergencies: Vec<EmergencyHandleResult>,
    pub queries: Vec<QueryResult>,
    pub statuses: Vec<DroneDynamicStatus>,
    pub ticks: u64,
    /// Claimed sorties and restricted areas as a GeoJSON `FeatureCollection`
    pub geojson: serde_json::Value,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse scenario {}", path.display()))
    }

    /// Register the fleet and airspace. Drones without a known service point are
    /// skipped with a warning. Returns the number of drones registered.
    pub fn register(&self, state: &FleetState) -> Result<usize> {
        let locations: HashMap<u32, Position> = self
            .service_points
            .iter()
            .map(|point| (point.id, point.location))
            .collect();

        let mut homes: HashMap<&str, (Position, Vec<AvailabilitySlot>)> = HashMap::new();
        for entry in &self.drones_for_service_points {
            let Some(location) = locations.get(&entry.service_point_id).copied() else {
                warn!(service_point_id = entry.service_point_id, "Unknown service point, skipping its drones");
                continue;
            };
            for listed in &entry.drones {
                if homes.contains_key(listed.id.as_str()) {
                    warn!(drone_id = %listed.id, "Drone listed at more than one service point, keeping the first");
                    continue;
                }
                homes.insert(listed.id.as_str(), (location, listed.availability.clone()));
            }
        }

        let mut registered = 0;
        for drone in &self.drones {
            let Some((location, availability)) = homes.get(drone.id.as_str()).cloned() else {
                warn!(drone_id = %drone.id, "Drone has no service point, skipping");
                continue;
            };
            state
                .register_drone(drone.clone(), location, availability)
                .with_context(|| format!("failed to register drone {}", drone.id))?;
            registered += 1;
        }

        for area in &self.restricted_areas {
            state
                .add_restricted_area(area.clone())
                .with_context(|| format!("failed to add restricted area {}", area.name))?;
        }

        info!(
            drones = registered,
            restricted_areas = self.restricted_areas.len(),
            "Scenario registered"
        );
        Ok(registered)
    }

    /// Run the scenario: assign the dispatches, handle emergencies, then fly
    /// until the fleet is idle.
    pub async fn run(self, config: &Config, bypass_override: bool) -> Result<ScenarioReport> {
        let state = Arc::new(FleetState::new());
        let planner = Arc::new(PathPlanner::new(config.planner_config()));
        self.register(&state)?;

        let bypass = self.bypass_restricted_areas || bypass_override;
        let dispatcher = Dispatcher::new(Arc::clone(&state), Arc::clone(&planner), self.rules.clone());
        let emergencies =
            EmergencyDispatcher::new(Arc::clone(&state), Arc::clone(&planner), self.rules.clone());

        let queries: Vec<QueryResult> = self
            .queries
            .iter()
            .map(|clauses| QueryResult {
                clauses: clauses.clone(),
                drone_ids: state.query(clauses),
            })
            .collect();

        let Scenario {
            dispatches,
            emergencies: emergency_tasks,
            ..
        } = self;
        let (dispatch, emergency_results) = tokio::task::spawn_blocking(move || {
            let dispatch = dispatcher.assign(&dispatches)?;
            let results = emergencies.handle(&emergency_tasks, bypass)?;
            Ok::<_, dispatch_core::DispatchError>((dispatch, results))
        })
        .await
        .context("planning task panicked")?
        .context("dispatch failed")?;

        info!(
            assigned = dispatch.assignments.len(),
            unassignable = dispatch.unassignable.len(),
            emergencies = emergency_results.len(),
            "Dispatch planned"
        );

        let executor = Arc::new(FlightExecutor::new(
            Arc::clone(&state),
            Arc::clone(&planner),
            self.rules.clone(),
            config.moves_per_tick,
        ));
        let ticks = run_until_idle(executor, config.tick_interval, config.max_run).await?;

        let geojson = dispatch.to_geojson(&state.restricted_areas());
        Ok(ScenarioReport {
            geojson,
            dispatch,
            emergencies: emergency_results,
            queries,
            statuses: state.statuses(),
            ticks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "servicePoints": [
            { "name": "Appleton Tower", "id": 1, "location": { "lng": 0.0, "lat": 0.0 } }
        ],
        "drones": [
            { "name": "Drone 1", "id": "1", "capability": {
                "cooling": true, "heating": false, "capacity": 4.0, "maxMoves": 2000,
                "costPerMove": 0.01, "costInitial": 4.3, "costFinal": 6.5 } },
            { "name": "Drone 2", "id": "2", "capability": {
                "cooling": false, "capacity": 8.0, "maxMoves": 1000,
                "costPerMove": 0.03, "costInitial": 2.6, "costFinal": 5.4 } },
            { "name": "Orphan", "id": "9", "capability": {
                "cooling": false, "capacity": 8.0, "maxMoves": 1000,
                "costPerMove": 0.03, "costInitial": 2.6, "costFinal": 5.4 } }
        ],
        "dronesForServicePoints": [
            { "servicePointId": 1, "drones": [ { "id": "1", "availability": [] }, { "id": "2" } ] }
        ],
        "restrictedAreas": [],
        "dispatches": [
            { "id": 100, "requirements": { "capacity": 1.0, "cooling": true },
              "delivery": { "lng": 0.0015, "lat": 0.0 } }
        ],
        "emergencies": [
            { "id": 200, "emergencyLevel": 1, "requirements": { "capacity": 2.0 },
              "delivery": { "lng": 0.0, "lat": 0.0015 } }
        ],
        "queries": [ [ { "attribute": "capacity", "operator": ">", "value": "5" } ] ]
    }"#;

    #[test]
    fn drones_without_service_point_are_skipped() {
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        let state = FleetState::new();
        assert_eq!(scenario.register(&state).unwrap(), 2);
        assert_eq!(state.drone_ids(), vec!["1", "2"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scenario_runs_until_the_fleet_is_idle() {
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();
        let config = Config {
            tick_interval: std::time::Duration::from_millis(1),
            moves_per_tick: 5,
            ..Config::default()
        };

        let report = scenario.run(&config, false).await.unwrap();
        assert_eq!(report.dispatch.assignments.len(), 1);
        assert_eq!(report.dispatch.assignments[0].drone_id, "1");
        assert!(report.emergencies[0].success);
        assert_eq!(report.queries[0].drone_ids, vec!["2"]);
        assert!(report.statuses.iter().all(|status| !status.is_busy));
        assert!(report.statuses.iter().all(|status| status.total_moves > 0));
        assert_eq!(report.geojson["features"].as_array().unwrap().len(), 1);
        assert_eq!(report.geojson["features"][0]["properties"]["droneId"], "1");
    }
}
