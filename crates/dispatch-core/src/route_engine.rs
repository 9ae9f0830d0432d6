//! A* path planner over a continuous plane with a quantized heading set.
//!
//! Every move displaces the drone by one fixed step along one of `heading_count`
//! evenly spaced headings, which turns the open plane into a finite branching search.
//! Positions are deduplicated through a quantized closed set, and branches that can
//! no longer reach the goal inside the drone's move budget are pruned.
//!
//! The planner holds no mutable state: one `PathPlanner` can serve any number of
//! concurrent `plan` calls.

use crate::error::DispatchError;
use crate::models::{DroneCapability, Position, RestrictedArea};
use crate::spatial::{segment_crosses_polygon, GeometryProvider, PlanarGeometry, DEFAULT_STEP_LENGTH};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Distance covered by one move; must match the geometry provider's step
    pub step_length: f64,
    /// A node this close to the goal counts as arrived
    pub close_tolerance: f64,
    pub heading_count: u16,
    /// Cell size of the closed set
    pub closed_set_quantum: f64,
    /// Hard ceiling on node expansions per call
    pub max_expansions: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            step_length: DEFAULT_STEP_LENGTH,
            close_tolerance: DEFAULT_STEP_LENGTH,
            heading_count: 16,
            closed_set_quantum: DEFAULT_STEP_LENGTH / 3.0,
            max_expansions: 250_000,
        }
    }
}

/// Why a planning call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Reached,
    AlreadyThere,
    StartRestricted,
    GoalRestricted,
    FrontierExhausted,
    ExpansionLimit,
}

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// Start-to-goal positions; empty when the goal is unreachable
    pub path: Vec<Position>,
    pub nodes_expanded: usize,
    /// Candidates dropped because they could not finish within the move budget
    pub budget_pruned: usize,
    pub termination: Termination,
}

impl PlanOutcome {
    fn finished(path: Vec<Position>, termination: Termination) -> Self {
        Self {
            path,
            nodes_expanded: 0,
            budget_pruned: 0,
            termination,
        }
    }

    pub fn moves(&self) -> u64 {
        self.path.len().saturating_sub(1) as u64
    }

    pub fn is_reachable(&self) -> bool {
        !self.path.is_empty()
    }
}

/// Arena entry. `parent` indexes the arena of the same planning call.
#[derive(Debug, Clone, Copy)]
struct SearchNode {
    position: Position,
    moves: u32,
    g_score: f64,
    parent: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CellKey {
    x: i64,
    y: i64,
}

#[derive(Debug, Clone, Copy)]
struct FloatOrd(f64);

impl PartialEq for FloatOrd {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FloatOrd {}

impl PartialOrd for FloatOrd {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloatOrd {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenEntry {
    f_score: FloatOrd,
    /// Insertion order; equal f-scores pop first-in first-out
    seq: u64,
    node: usize,
}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.f_score
            .cmp(&other.f_score)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// A restricted area prepared for repeated move checks.
struct Obstacle<'a> {
    ring: &'a [Position],
    bounds: (f64, f64, f64, f64),
}

impl<'a> Obstacle<'a> {
    fn new(area: &'a RestrictedArea) -> Self {
        Self {
            ring: area.ring(),
            bounds: area.bounds(),
        }
    }

    fn overlaps_box(&self, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> bool {
        let (bx0, by0, bx1, by1) = self.bounds;
        min_x <= bx1 && max_x >= bx0 && min_y <= by1 && max_y >= by0
    }

    fn contains<G: GeometryProvider>(&self, geometry: &G, point: Position) -> bool {
        self.overlaps_box(point.lng, point.lat, point.lng, point.lat)
            && geometry.point_in_polygon(point, self.ring)
    }

    fn blocks_move<G: GeometryProvider>(&self, geometry: &G, from: Position, to: Position) -> bool {
        if !self.overlaps_box(
            from.lng.min(to.lng),
            from.lat.min(to.lat),
            from.lng.max(to.lng),
            from.lat.max(to.lat),
        ) {
            return false;
        }
        geometry.point_in_polygon(to, self.ring) || segment_crosses_polygon(from, to, self.ring)
    }
}

/// A* planner bound to a geometry provider.
#[derive(Debug, Clone)]
pub struct PathPlanner<G = PlanarGeometry> {
    config: PlannerConfig,
    geometry: G,
}

impl PathPlanner<PlanarGeometry> {
    pub fn new(config: PlannerConfig) -> Self {
        let geometry = PlanarGeometry::new(config.step_length);
        Self { config, geometry }
    }
}

impl Default for PathPlanner<PlanarGeometry> {
    fn default() -> Self {
        Self::new(PlannerConfig::default())
    }
}

impl<G: GeometryProvider> PathPlanner<G> {
    pub fn with_geometry(config: PlannerConfig, geometry: G) -> Self {
        Self { config, geometry }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn geometry(&self) -> &G {
        &self.geometry
    }

    /// Straight-line move estimate, ignoring obstacles.
    pub fn estimate_moves(&self, from: Position, to: Position) -> u64 {
        let distance = self.geometry.distance(from, to);
        if distance <= self.config.close_tolerance {
            return 0;
        }
        // Absorb division noise so an exact multiple of the step is not rounded up.
        (distance / self.config.step_length - 1e-9).ceil() as u64
    }

    /// Plan a path from `start` to `goal`. An empty path means unreachable.
    pub fn plan(
        &self,
        start: Position,
        goal: Position,
        obstacles: &[RestrictedArea],
        capability: &DroneCapability,
    ) -> Result<Vec<Position>, DispatchError> {
        Ok(self.plan_detailed(start, goal, obstacles, capability)?.path)
    }

    /// Plan a path and report search statistics.
    pub fn plan_detailed(
        &self,
        start: Position,
        goal: Position,
        obstacles: &[RestrictedArea],
        capability: &DroneCapability,
    ) -> Result<PlanOutcome, DispatchError> {
        start.validate("start")?;
        goal.validate("goal")?;
        capability.validate("(planner input)")?;
        for area in obstacles {
            area.validate()?;
        }

        let tolerance = self.config.close_tolerance;
        if self.geometry.distance(start, goal) <= tolerance {
            return Ok(PlanOutcome::finished(vec![start], Termination::AlreadyThere));
        }

        let obstacles: Vec<Obstacle<'_>> = obstacles.iter().map(Obstacle::new).collect();
        if obstacles.iter().any(|o| o.contains(&self.geometry, goal)) {
            return Ok(PlanOutcome::finished(Vec::new(), Termination::GoalRestricted));
        }
        if obstacles.iter().any(|o| o.contains(&self.geometry, start)) {
            return Ok(PlanOutcome::finished(Vec::new(), Termination::StartRestricted));
        }

        Ok(self.search(start, goal, &obstacles, capability))
    }

    fn search(
        &self,
        start: Position,
        goal: Position,
        obstacles: &[Obstacle<'_>],
        capability: &DroneCapability,
    ) -> PlanOutcome {
        let step = self.config.step_length;
        let tolerance = self.config.close_tolerance;
        let max_moves = capability.max_moves;
        let heading_count = self.config.heading_count.max(1);
        let heading_delta = 360.0 / f64::from(heading_count);
        // A free drone still needs a positive per-move cost to order the frontier.
        let move_cost = if capability.cost_per_move > 0.0 {
            capability.cost_per_move
        } else {
            1.0
        };

        // Lower bound on moves still needed; each move covers at most one step.
        let remaining_moves =
            |p: Position| ((self.geometry.distance(p, goal) - tolerance) / step).max(0.0);

        let mut arena: Vec<SearchNode> = vec![SearchNode {
            position: start,
            moves: 0,
            g_score: 0.0,
            parent: None,
        }];
        let mut open_set: BinaryHeap<Reverse<OpenEntry>> = BinaryHeap::new();
        let mut closed_set: HashSet<CellKey> = HashSet::new();
        let mut best_g: HashMap<CellKey, f64> = HashMap::new();
        let mut seq = 0u64;

        best_g.insert(self.cell(start), 0.0);
        open_set.push(Reverse(OpenEntry {
            f_score: FloatOrd(remaining_moves(start) * move_cost),
            seq,
            node: 0,
        }));

        let mut nodes_expanded = 0usize;
        let mut budget_pruned = 0usize;

        while let Some(Reverse(entry)) = open_set.pop() {
            let current = arena[entry.node];
            let current_key = self.cell(current.position);
            if closed_set.contains(&current_key) {
                continue;
            }
            let recorded = best_g.get(&current_key).copied().unwrap_or(f64::INFINITY);
            if current.g_score > recorded + 1e-9 {
                continue;
            }

            if nodes_expanded >= self.config.max_expansions {
                return PlanOutcome {
                    path: Vec::new(),
                    nodes_expanded,
                    budget_pruned,
                    termination: Termination::ExpansionLimit,
                };
            }
            nodes_expanded += 1;

            if self.geometry.distance(current.position, goal) <= tolerance {
                return PlanOutcome {
                    path: reconstruct_path(&arena, entry.node),
                    nodes_expanded,
                    budget_pruned,
                    termination: Termination::Reached,
                };
            }

            closed_set.insert(current_key);
            let next_moves = current.moves + 1;

            for i in 0..heading_count {
                let next = self
                    .geometry
                    .move_step(current.position, f64::from(i) * heading_delta);
                let next_key = self.cell(next);
                if closed_set.contains(&next_key) {
                    continue;
                }

                if f64::from(next_moves) + remaining_moves(next).floor() > f64::from(max_moves) {
                    budget_pruned += 1;
                    continue;
                }

                if obstacles
                    .iter()
                    .any(|o| o.blocks_move(&self.geometry, current.position, next))
                {
                    continue;
                }

                let tentative_g = current.g_score + move_cost;
                if tentative_g + 1e-9 < best_g.get(&next_key).copied().unwrap_or(f64::INFINITY) {
                    best_g.insert(next_key, tentative_g);
                    arena.push(SearchNode {
                        position: next,
                        moves: next_moves,
                        g_score: tentative_g,
                        parent: Some(entry.node),
                    });
                    seq += 1;
                    open_set.push(Reverse(OpenEntry {
                        f_score: FloatOrd(tentative_g + remaining_moves(next) * move_cost),
                        seq,
                        node: arena.len() - 1,
                    }));
                }
            }
        }

        PlanOutcome {
            path: Vec::new(),
            nodes_expanded,
            budget_pruned,
            termination: Termination::FrontierExhausted,
        }
    }

    fn cell(&self, p: Position) -> CellKey {
        let quantum = if self.config.closed_set_quantum > 0.0 {
            self.config.closed_set_quantum
        } else {
            self.config.step_length / 3.0
        };
        CellKey {
            x: (p.lng / quantum).round() as i64,
            y: (p.lat / quantum).round() as i64,
        }
    }
}

fn reconstruct_path(arena: &[SearchNode], last: usize) -> Vec<Position> {
    let mut path = Vec::new();
    let mut current = Some(last);
    while let Some(index) = current {
        let node = &arena[index];
        path.push(node.position);
        current = node.parent;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::point_in_polygon_inclusive;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::{Duration, Instant};

    fn capability(max_moves: u32) -> DroneCapability {
        DroneCapability {
            cooling: false,
            heating: false,
            capacity: 4.0,
            max_moves,
            cost_per_move: 0.01,
            cost_initial: 4.3,
            cost_final: 6.5,
        }
    }

    fn rect(name: &str, min_lng: f64, min_lat: f64, max_lng: f64, max_lat: f64) -> RestrictedArea {
        RestrictedArea::new(
            name,
            vec![
                Position::new(min_lng, min_lat),
                Position::new(max_lng, min_lat),
                Position::new(max_lng, max_lat),
                Position::new(min_lng, max_lat),
                Position::new(min_lng, min_lat),
            ],
        )
    }

    fn assert_path_clear(path: &[Position], areas: &[RestrictedArea]) {
        for area in areas {
            for point in path {
                assert!(
                    !point_in_polygon_inclusive(*point, area.ring()),
                    "path point ({}, {}) inside {}",
                    point.lng,
                    point.lat,
                    area.name
                );
            }
            for hop in path.windows(2) {
                assert!(!segment_crosses_polygon(hop[0], hop[1], area.ring()));
            }
        }
    }

    #[test]
    fn same_position_returns_start_even_inside_restricted_area() {
        let planner = PathPlanner::default();
        let start = Position::new(0.0005, 0.0005);
        let areas = vec![rect("box", 0.0, 0.0, 0.001, 0.001)];

        let outcome = planner
            .plan_detailed(start, Position::new(0.00051, 0.0005), &areas, &capability(100))
            .unwrap();
        assert_eq!(outcome.termination, Termination::AlreadyThere);
        assert_eq!(outcome.path.len(), 1);
        assert!(outcome.path[0].is_close_to(&start, 1e-12));
    }

    #[test]
    fn nearby_unobstructed_goal_is_reached() {
        let planner = PathPlanner::default();
        let start = Position::new(-3.19, 55.944);
        let goal = Position::new(-3.188, 55.945);

        let outcome = planner.plan_detailed(start, goal, &[], &capability(2000)).unwrap();
        assert_eq!(outcome.termination, Termination::Reached);
        let path = &outcome.path;
        assert!(path[0].is_close_to(&start, 1e-12));
        let tolerance = planner.config().close_tolerance;
        assert!(path[path.len() - 1].is_close_to(&goal, tolerance));

        let lower_bound = ((start.planar_distance(&goal) - tolerance) / DEFAULT_STEP_LENGTH).floor();
        assert!(outcome.moves() as f64 >= lower_bound);
        assert!(outcome.moves() <= planner.estimate_moves(start, goal) + 2);
    }

    #[test]
    fn goal_on_boundary_vertex_is_unreachable() {
        let planner = PathPlanner::default();
        let areas = vec![rect("box", 0.001, 0.001, 0.002, 0.002)];

        let outcome = planner
            .plan_detailed(Position::new(0.0, 0.0), Position::new(0.001, 0.001), &areas, &capability(500))
            .unwrap();
        assert!(outcome.path.is_empty());
        assert_eq!(outcome.termination, Termination::GoalRestricted);
    }

    #[test]
    fn goal_walled_in_by_several_areas_is_unreachable() {
        let planner = PathPlanner::default();
        let walls = vec![
            rect("west", 0.0023, -0.0007, 0.0025, 0.0007),
            rect("east", 0.0035, -0.0007, 0.0037, 0.0007),
            rect("south", 0.0023, -0.0007, 0.0037, -0.0005),
            rect("north", 0.0023, 0.0005, 0.0037, 0.0007),
        ];

        let outcome = planner
            .plan_detailed(Position::new(0.0, 0.0), Position::new(0.003, 0.0), &walls, &capability(40))
            .unwrap();
        assert!(outcome.path.is_empty());
        assert_eq!(outcome.termination, Termination::FrontierExhausted);
    }

    #[test]
    fn path_detours_around_wall() {
        let planner = PathPlanner::default();
        let start = Position::new(0.0, 0.0);
        let goal = Position::new(0.003, 0.0);
        let walls = vec![rect("wall", 0.0014, -0.001, 0.0016, 0.001)];

        let path = planner.plan(start, goal, &walls, &capability(500)).unwrap();
        assert!(!path.is_empty());
        assert_path_clear(&path, &walls);
        assert!(path.len() as u64 - 1 > planner.estimate_moves(start, goal));
    }

    #[test]
    fn move_budget_too_small_yields_empty_path() {
        let planner = PathPlanner::default();
        let outcome = planner
            .plan_detailed(Position::new(0.0, 0.0), Position::new(0.003, 0.0), &[], &capability(10))
            .unwrap();
        assert!(outcome.path.is_empty());
        assert_eq!(outcome.termination, Termination::FrontierExhausted);
        assert!(outcome.budget_pruned > 0);
    }

    #[test]
    fn expansion_ceiling_stops_search() {
        let planner = PathPlanner::new(PlannerConfig {
            max_expansions: 3,
            ..PlannerConfig::default()
        });
        let outcome = planner
            .plan_detailed(Position::new(0.0, 0.0), Position::new(0.003, 0.0), &[], &capability(500))
            .unwrap();
        assert!(outcome.path.is_empty());
        assert_eq!(outcome.termination, Termination::ExpansionLimit);
    }

    #[test]
    fn identical_inputs_give_identical_paths() {
        let planner = PathPlanner::default();
        let walls = vec![rect("wall", 0.0014, -0.001, 0.0016, 0.001)];
        let start = Position::new(0.0, 0.0);
        let goal = Position::new(0.003, 0.0002);

        let first = planner.plan(start, goal, &walls, &capability(500)).unwrap();
        let second = planner.plan(start, goal, &walls, &capability(500)).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.lng.to_bits(), b.lng.to_bits());
            assert_eq!(a.lat.to_bits(), b.lat.to_bits());
        }
    }

    #[test]
    fn malformed_inputs_are_rejected_before_search() {
        let planner = PathPlanner::default();
        let start = Position::new(0.0, 0.0);
        let goal = Position::new(0.001, 0.0);

        let zero_budget = planner.plan(start, goal, &[], &capability(0));
        assert!(matches!(zero_budget, Err(DispatchError::InvalidCapability { .. })));

        let sliver = RestrictedArea::new("sliver", vec![Position::new(1.0, 1.0), Position::new(2.0, 2.0)]);
        let bad_polygon = planner.plan(start, goal, &[sliver], &capability(100));
        assert!(matches!(bad_polygon, Err(DispatchError::InvalidPolygon { .. })));

        let bad_start = planner.plan(Position::new(f64::NAN, 0.0), goal, &[], &capability(100));
        assert!(matches!(bad_start, Err(DispatchError::InvalidPosition(_))));
    }

    #[test]
    fn free_drone_still_plans() {
        let planner = PathPlanner::default();
        let mut free = capability(500);
        free.cost_per_move = 0.0;
        let path = planner
            .plan(Position::new(0.0, 0.0), Position::new(0.002, 0.001), &[], &free)
            .unwrap();
        assert!(!path.is_empty());
    }

    #[test]
    fn ten_scattered_obstacles_plan_within_two_seconds() {
        let planner = PathPlanner::default();
        let start = Position::new(-3.1900, 55.9440);
        let goal = Position::new(-3.1860, 55.9440);
        let mut rng = StdRng::seed_from_u64(7);

        let mut areas = Vec::new();
        while areas.len() < 10 {
            let lng = rng.random_range(-3.1895..-3.1868);
            let lat = rng.random_range(55.9425..55.9452);
            let centre = Position::new(lng + 0.00015, lat + 0.00015);
            if centre.planar_distance(&start) < 0.0006 || centre.planar_distance(&goal) < 0.0006 {
                continue;
            }
            areas.push(rect(&format!("zone-{}", areas.len()), lng, lat, lng + 0.0003, lat + 0.0003));
        }

        let started = Instant::now();
        let path = planner.plan(start, goal, &areas, &capability(2000)).unwrap();
        let elapsed = started.elapsed();

        assert!(!path.is_empty());
        assert_path_clear(&path, &areas);
        assert!(elapsed < Duration::from_secs(2), "planning took {:?}", elapsed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_calls_share_one_planner() {
        let planner = std::sync::Arc::new(PathPlanner::default());
        let areas = std::sync::Arc::new(vec![rect("wall", 0.0007, -0.0008, 0.0009, 0.0008)]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let planner = std::sync::Arc::clone(&planner);
            let areas = std::sync::Arc::clone(&areas);
            handles.push(tokio::task::spawn_blocking(move || {
                planner
                    .plan(Position::new(0.0, 0.0), Position::new(0.0015, 0.0), &areas, &capability(200))
                    .unwrap()
            }));
        }

        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await.unwrap());
        }
        let first = &paths[0];
        assert!(!first.is_empty());
        for path in &paths[1..] {
            assert_eq!(path.len(), first.len());
            for (a, b) in path.iter().zip(first) {
                assert!(a.is_close_to(b, 0.0));
            }
        }
    }
}
