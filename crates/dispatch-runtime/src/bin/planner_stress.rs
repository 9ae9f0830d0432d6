use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

use dispatch_core::{DroneCapability, PathPlanner, Position, RestrictedArea};
use dispatch_runtime::config::Config;

struct StressRoute {
    name: &'static str,
    start: Position,
    goal: Position,
    obstacles: usize,
    seed: u64,
}

fn main() {
    let config = Config::from_env();
    let planner = PathPlanner::new(config.planner_config());
    let capability = DroneCapability {
        cooling: false,
        heating: false,
        capacity: 4.0,
        max_moves: 2000,
        cost_per_move: 0.01,
        cost_initial: 4.3,
        cost_final: 6.5,
    };

    let routes = vec![
        StressRoute {
            name: "Short hop, open sky",
            start: Position::new(-3.1869, 55.9445),
            goal: Position::new(-3.1840, 55.9460),
            obstacles: 0,
            seed: 1,
        },
        StressRoute {
            name: "Short hop, 10 obstacles",
            start: Position::new(-3.1869, 55.9445),
            goal: Position::new(-3.1840, 55.9460),
            obstacles: 10,
            seed: 7,
        },
        StressRoute {
            name: "Across town, 25 obstacles",
            start: Position::new(-3.1920, 55.9420),
            goal: Position::new(-3.1780, 55.9490),
            obstacles: 25,
            seed: 42,
        },
        StressRoute {
            name: "Across town, 60 obstacles",
            start: Position::new(-3.1920, 55.9420),
            goal: Position::new(-3.1780, 55.9490),
            obstacles: 60,
            seed: 1234,
        },
    ];

    for route in routes {
        println!("\n=== {} ===", route.name);
        let areas = obstacle_field(route.start, route.goal, route.obstacles, route.seed);

        let started = Instant::now();
        let outcome = match planner.plan_detailed(route.start, route.goal, &areas, &capability) {
            Ok(outcome) => outcome,
            Err(e) => {
                println!("Result: ERROR ({})", e);
                continue;
            }
        };
        let elapsed = started.elapsed();

        if outcome.is_reachable() {
            println!(
                "Result: OK | moves={} nodes={} pruned={}",
                outcome.moves(),
                outcome.nodes_expanded,
                outcome.budget_pruned
            );
        } else {
            println!(
                "Result: NO PATH ({:?}) | nodes={} pruned={}",
                outcome.termination, outcome.nodes_expanded, outcome.budget_pruned
            );
        }
        println!(
            "Estimate: {} moves | time={:.1}ms",
            planner.estimate_moves(route.start, route.goal),
            elapsed.as_secs_f64() * 1000.0
        );
    }
}

/// Small random squares between `start` and `goal`, kept clear of both endpoints.
fn obstacle_field(start: Position, goal: Position, count: usize, seed: u64) -> Vec<RestrictedArea> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (min_lng, max_lng) = (start.lng.min(goal.lng), start.lng.max(goal.lng));
    let (min_lat, max_lat) = (start.lat.min(goal.lat), start.lat.max(goal.lat));
    let clearance = 0.0006;

    let mut areas = Vec::with_capacity(count);
    while areas.len() < count {
        let center = Position::new(
            rng.random_range(min_lng..=max_lng),
            rng.random_range(min_lat..=max_lat),
        );
        if center.planar_distance(&start) < clearance || center.planar_distance(&goal) < clearance {
            continue;
        }
        let half = rng.random_range(0.00005..0.0002);
        areas.push(RestrictedArea::new(
            format!("obstacle-{}", areas.len() + 1),
            vec![
                Position::new(center.lng - half, center.lat - half),
                Position::new(center.lng + half, center.lat - half),
                Position::new(center.lng + half, center.lat + half),
                Position::new(center.lng - half, center.lat + half),
            ],
        ));
    }
    areas
}
