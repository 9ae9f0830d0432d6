pub mod assignment;
pub mod error;
pub mod geojson;
pub mod models;
pub mod query;
pub mod route_engine;
pub mod routing;
pub mod rules;
pub mod spatial;

pub use assignment::{
    AssignmentEngine, AssignmentPlan, DroneCandidate, UnassignableReason, UnassignableTask,
};
pub use error::{DispatchError, RestrictedAreaBlockage};
pub use models::{
    AvailabilitySlot, DispatchRecord, Drone, DroneAssignment, DroneCapability,
    DroneDynamicStatus, DroneForServicePoint, EmergencyDispatchRecord, EmergencyHandleResult,
    FlightLeg, LegKind, Position, Requirements, RestrictedArea, ServicePoint,
};
pub use query::{drones_with_cooling, query_drones, QueryClause};
pub use route_engine::{PathPlanner, PlanOutcome, PlannerConfig, Termination};
pub use routing::{route_assignment, with_hover, RouteError, RoutedAssignment};
pub use rules::DispatchRules;
pub use spatial::{GeometryProvider, PlanarGeometry};
