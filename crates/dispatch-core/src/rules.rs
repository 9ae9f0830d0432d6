//! Dispatch policy constants.

use serde::{Deserialize, Serialize};

use crate::models::LOWEST_EMERGENCY_LEVEL;

/// Configuration for dispatch and emergency policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRules {
    /// Hover moves flown on arrival at each delivery or emergency target
    pub hover_moves_per_delivery: u32,
    /// Whether a sortie ends with a leg back to the service point
    pub return_to_service_point: bool,
    /// Emergency levels at or below this value need a human to confirm a bypass
    pub human_confirmation_max_level: u8,
    /// Penalty multiplier when an emergency pulls a busy drone off its queued work
    pub reassign_penalty_factor: f64,
    /// Area name reported when a blockage cannot be attributed to a specific polygon
    pub unknown_area_name: String,
}

impl Default for DispatchRules {
    fn default() -> Self {
        Self {
            hover_moves_per_delivery: 1,
            return_to_service_point: true,
            human_confirmation_max_level: LOWEST_EMERGENCY_LEVEL - 1,
            reassign_penalty_factor: 1.5,
            unknown_area_name: "unknown restricted area".to_string(),
        }
    }
}

impl DispatchRules {
    pub fn requires_human_confirmation(&self, emergency_level: u8) -> bool {
        emergency_level <= self.human_confirmation_max_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_lowest_level_skips_confirmation() {
        let rules = DispatchRules::default();
        for level in 1..=4 {
            assert!(rules.requires_human_confirmation(level));
        }
        assert!(!rules.requires_human_confirmation(5));
    }
}
