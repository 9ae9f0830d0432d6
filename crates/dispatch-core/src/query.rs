//! Attribute queries over the fleet, e.g. `capacity >= 4` and `cooling = true`.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::models::Drone;

/// Numeric equality tolerance.
const NUMERIC_EPS: f64 = 1e-4;

/// One `attribute operator value` clause. All fields arrive as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryClause {
    pub attribute: String,
    pub operator: String,
    pub value: String,
}

impl QueryClause {
    pub fn new(attribute: &str, operator: &str, value: &str) -> Self {
        Self {
            attribute: attribute.to_string(),
            operator: operator.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl FromStr for Comparison {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "=" | "==" => Ok(Comparison::Eq),
            "!=" => Ok(Comparison::Ne),
            "<" => Ok(Comparison::Lt),
            ">" => Ok(Comparison::Gt),
            "<=" => Ok(Comparison::Le),
            ">=" => Ok(Comparison::Ge),
            _ => Err(()),
        }
    }
}

/// Value of a drone attribute, typed for comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

/// Look up an attribute by case-insensitive name.
pub fn attribute_value(drone: &Drone, attribute: &str) -> Option<AttributeValue> {
    let capability = &drone.capability;
    let value = match attribute.to_ascii_lowercase().as_str() {
        "id" => AttributeValue::Text(drone.id.clone()),
        "name" => AttributeValue::Text(drone.name.clone()),
        "capacity" => AttributeValue::Number(capability.capacity),
        "cooling" => AttributeValue::Flag(capability.cooling),
        "heating" => AttributeValue::Flag(capability.heating),
        "maxmoves" => AttributeValue::Number(f64::from(capability.max_moves)),
        "costpermove" => AttributeValue::Number(capability.cost_per_move),
        "costinitial" => AttributeValue::Number(capability.cost_initial),
        "costfinal" => AttributeValue::Number(capability.cost_final),
        _ => return None,
    };
    Some(value)
}

/// Whether `drone` satisfies `clause`. Unknown attributes, unknown operators and
/// unparsable values never match.
pub fn matches(drone: &Drone, clause: &QueryClause) -> bool {
    let Some(value) = attribute_value(drone, &clause.attribute) else {
        return false;
    };
    let Ok(op) = clause.operator.parse::<Comparison>() else {
        return false;
    };
    let input = clause.value.trim();

    match value {
        AttributeValue::Number(actual) => match input.parse::<f64>() {
            Ok(expected) => match op {
                Comparison::Eq => (actual - expected).abs() < NUMERIC_EPS,
                Comparison::Ne => (actual - expected).abs() >= NUMERIC_EPS,
                Comparison::Lt => actual < expected,
                Comparison::Gt => actual > expected,
                Comparison::Le => actual <= expected,
                Comparison::Ge => actual >= expected,
            },
            Err(_) => false,
        },
        AttributeValue::Flag(actual) => {
            let expected = input.eq_ignore_ascii_case("true");
            match op {
                Comparison::Eq => actual == expected,
                Comparison::Ne => actual != expected,
                _ => false,
            }
        }
        AttributeValue::Text(actual) => match op {
            Comparison::Eq => actual == input,
            Comparison::Ne => actual != input,
            _ => false,
        },
    }
}

/// Ids of the drones matching every clause, in input order.
pub fn query_drones<'a>(drones: impl IntoIterator<Item = &'a Drone>, clauses: &[QueryClause]) -> Vec<String> {
    drones
        .into_iter()
        .filter(|drone| clauses.iter().all(|clause| matches(drone, clause)))
        .map(|drone| drone.id.clone())
        .collect()
}

/// Ids of the drones whose cooling support equals `cooling`.
pub fn drones_with_cooling<'a>(drones: impl IntoIterator<Item = &'a Drone>, cooling: bool) -> Vec<String> {
    drones
        .into_iter()
        .filter(|drone| drone.capability.cooling == cooling)
        .map(|drone| drone.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DroneCapability;

    fn fleet() -> Vec<Drone> {
        let make = |id: &str, capacity: f64, cooling: bool| Drone {
            name: format!("Drone {}", id),
            id: id.to_string(),
            capability: DroneCapability {
                cooling,
                heating: false,
                capacity,
                max_moves: 2000,
                cost_per_move: 0.01,
                cost_initial: 4.3,
                cost_final: 6.5,
            },
        };
        vec![make("1", 4.0, true), make("2", 8.0, false), make("3", 12.0, true)]
    }

    #[test]
    fn numeric_clauses_compare_with_tolerance() {
        let drones = fleet();
        let clauses = vec![QueryClause::new("capacity", ">=", "8")];
        assert_eq!(query_drones(&drones, &clauses), vec!["2", "3"]);

        let exact = vec![QueryClause::new("costPerMove", "=", "0.01000001")];
        assert_eq!(query_drones(&drones, &exact).len(), 3);
    }

    #[test]
    fn clauses_combine_with_and() {
        let drones = fleet();
        let clauses = vec![
            QueryClause::new("COOLING", "=", "true"),
            QueryClause::new("capacity", "<", "10"),
        ];
        assert_eq!(query_drones(&drones, &clauses), vec!["1"]);
    }

    #[test]
    fn unsupported_operators_and_values_never_match() {
        let drones = fleet();
        assert!(query_drones(&drones, &[QueryClause::new("cooling", ">", "false")]).is_empty());
        assert!(query_drones(&drones, &[QueryClause::new("capacity", "=", "lots")]).is_empty());
        assert!(query_drones(&drones, &[QueryClause::new("wingspan", "=", "2")]).is_empty());
        assert!(query_drones(&drones, &[QueryClause::new("name", "<", "Drone 2")]).is_empty());
    }

    #[test]
    fn cooling_filter_selects_by_support() {
        let drones = fleet();
        assert_eq!(drones_with_cooling(&drones, true), vec!["1", "3"]);
        assert_eq!(drones_with_cooling(&drones, false), vec!["2"]);
    }
}
