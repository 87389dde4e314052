//! Spore Tree entry point
//!
//! Headless run of the full pipeline from a resting offset: free decay,
//! control tree, spore tree with meeting search, graph insertion, valence
//! report and one optimiser step. Prints a JSON summary to stdout.
//!
//! Usage: `spore-tree [settings.json] [seed]`

use std::error::Error;

use glam::DVec2;
use rand::SeedableRng;
use rand_pcg::Pcg32;
use serde::Serialize;

use spore_tree::Settings;
use spore_tree::sim::{
    ControlTreeBuilder, GraphSummary, PendulumSystem, SamplingMethod, SporeGraph, SporeLogic, SporeTree,
    ValenceAnalyzer, apply_optimal_step, pair_tree,
};

const INITIAL_STATE: DVec2 = DVec2::new(0.5, 0.0);
const FREE_STEPS: usize = 20;
const GHOST_SAMPLES: usize = 5;
const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Serialize)]
struct RunSummary {
    seed: u64,
    free_decay_end: DVec2,
    eigenvalue_magnitudes: [f64; 2],
    converged_groups: usize,
    total_groups: usize,
    paired: bool,
    max_meeting_distance: f64,
    dt_vector: [f64; 12],
    merged_grandchildren: usize,
    graph_spores: usize,
    graph_edges: usize,
    valence: GraphSummary,
    ghost_positions: Vec<DVec2>,
    optimal_control: f64,
    optimal_dt: f64,
    root_cost_after: f64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Spore Tree starting...");

    let mut args = std::env::args().skip(1);
    let settings = match args.next() {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    settings.validate()?;
    let seed = match args.next() {
        Some(s) => s.parse::<u64>()?,
        None => DEFAULT_SEED,
    };

    let pendulum = PendulumSystem::with_integrator(settings.pendulum, settings.integrator)?;
    if let Some(check) = pendulum.verify_discretization() {
        log::info!(
            "Discretisation check: |A| error {:.2e}, |B| error {:.2e}",
            check.a_error,
            check.b_error
        );
    }

    let trajectory = pendulum.simulate_discrete(INITIAL_STATE, &[0.0; FREE_STEPS], FREE_STEPS);
    let free_decay_end = trajectory.last().copied().unwrap_or(INITIAL_STATE);
    log::info!("Free decay: {:?} -> {:?}", INITIAL_STATE, free_decay_end);

    let mut builder = ControlTreeBuilder::from_settings(&settings.tree)?;
    let build = builder.build_tree(&pendulum, INITIAL_STATE)?;
    log::info!(
        "Control tree: {}/{} convergence groups converged",
        build.convergence.num_converged,
        build.convergence.total_groups
    );

    let tree = SporeTree::from_settings(&pendulum, INITIAL_STATE, &settings.tree)?;
    let (pairs, paired) = pair_tree(&tree, &pendulum, &settings.pairing)?;
    log::info!(
        "{} grandchild pairs, worst gap {:.3e}, applied: {}",
        pairs.len(),
        paired.max_distance,
        paired.applied
    );
    let mut tree = SporeTree::from_dt_vector(&pendulum, INITIAL_STATE, &paired.dt_vector)?;
    let merged = tree.merge_close_grandchildren(settings.tree.merge_distance_threshold);

    let mut graph = SporeGraph::new();
    let goal = DVec2::ZERO;
    let ids = graph.insert_tree(&tree, goal, settings.pendulum.dt)?;
    let mut analyzer = ValenceAnalyzer::new();
    let root_valence = analyzer.analyze_spore_valence(&graph, ids.root)?;
    log::debug!("{}", root_valence.summary());
    let valence = analyzer.graph_summary(&graph);

    let mut rng = Pcg32::seed_from_u64(seed);
    let mut root = graph
        .spore(ids.root)
        .cloned()
        .unwrap_or_else(|| SporeLogic::new(goal, INITIAL_STATE, settings.pendulum.dt));
    let controls = root.sample_controls(&pendulum, GHOST_SAMPLES, SamplingMethod::Random, &mut rng);
    let ghost_positions = root.ghost_positions(&pendulum, &controls, settings.pendulum.dt)?;

    let step = apply_optimal_step(&mut root, &pendulum, &settings.optimizer);
    if step.improved {
        root.evolve(&pendulum, step.control, Some(step.dt));
    }
    log::info!(
        "Root step: u = {:+.4}, dt = {:.4}, cost {:.4} (alive: {})",
        step.control,
        step.dt,
        root.cost(),
        root.is_alive()
    );

    let summary = RunSummary {
        seed,
        free_decay_end,
        eigenvalue_magnitudes: pendulum.discrete_eigenvalue_magnitudes(),
        converged_groups: build.convergence.num_converged,
        total_groups: build.convergence.total_groups,
        paired: paired.applied,
        max_meeting_distance: paired.max_distance,
        dt_vector: tree.dt_vector().unwrap_or(paired.dt_vector),
        merged_grandchildren: merged.total_merged(),
        graph_spores: graph.len(),
        graph_edges: graph.edge_count(),
        valence,
        ghost_positions,
        optimal_control: step.control,
        optimal_dt: step.dt,
        root_cost_after: root.cost(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
