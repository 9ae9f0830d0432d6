//! Shared fleet state.

mod store;

pub use store::{Advance, DroneSlot, FleetState, LegStart, PreemptOutcome, START_MATCH_TOLERANCE};
