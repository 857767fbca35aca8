use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use isat::{IsatCache, IsatConfig, QuadraticChemistry};

#[derive(Parser, Debug)]
#[command(name = "isat", about = "Adaptive tabulation cache driver on synthetic kinetics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fire uniformly random composition queries at the cache and
    /// report the retrieve/grow/add split.
    Synthetic {
        /// Number of species in the synthetic mechanism.
        #[arg(long, default_value_t = 8)]
        species: usize,
        /// Number of queries to run.
        #[arg(long, default_value_t = 100_000)]
        queries: usize,
        /// EOA error tolerance.
        #[arg(long, default_value_t = 1e-3)]
        tolerance: f64,
        /// Leaf cap of the tree.
        #[arg(long, default_value_t = 4096)]
        max_elements: usize,
        /// Half-width of the sampled composition box.
        #[arg(long, default_value_t = 1.0)]
        spread: f64,
        /// RNG seed for the query stream.
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Walk a correlated trajectory through composition space, the
    /// access pattern a flow solver produces, and report per-block
    /// statistics.
    Trajectory {
        /// Number of species in the synthetic mechanism.
        #[arg(long, default_value_t = 8)]
        species: usize,
        /// Number of queries to run.
        #[arg(long, default_value_t = 100_000)]
        queries: usize,
        /// EOA error tolerance.
        #[arg(long, default_value_t = 1e-3)]
        tolerance: f64,
        /// Leaf cap of the tree.
        #[arg(long, default_value_t = 4096)]
        max_elements: usize,
        /// Step size of the random walk.
        #[arg(long, default_value_t = 1e-3)]
        step: f64,
        /// Secondary-search budget.
        #[arg(long, default_value_t = 10)]
        max_2nd_search: usize,
        /// MRU list capacity.
        #[arg(long, default_value_t = 16)]
        mru_size: usize,
        /// RNG seed for the query stream.
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Synthetic {
            species,
            queries,
            tolerance,
            max_elements,
            spread,
            seed,
        } => run_synthetic(species, queries, tolerance, max_elements, spread, seed),
        Commands::Trajectory {
            species,
            queries,
            tolerance,
            max_elements,
            step,
            max_2nd_search,
            mru_size,
            seed,
        } => run_trajectory(
            species,
            queries,
            tolerance,
            max_elements,
            step,
            max_2nd_search,
            mru_size,
            seed,
        ),
    }
}

/// Synthetic mechanism: mild coupling between neighbouring species and
/// quadratic self-interaction, enough curvature that grows and adds
/// both happen.
fn synthetic_solver(species: usize, rng: &mut StdRng) -> QuadraticChemistry {
    let n = species + 2;
    let mut m = DMatrix::zeros(n, n);
    for i in 0..n {
        m[(i, i)] = 0.2 + rng.gen_range(0.0..0.1);
        if i + 1 < n {
            let coupling = rng.gen_range(-0.02..0.02);
            m[(i, i + 1)] = coupling;
            m[(i + 1, i)] = -coupling;
        }
    }
    let b = DVector::from_fn(n, |_, _| rng.gen_range(-0.01..0.01));
    let c = DVector::from_element(n, 0.5);
    QuadraticChemistry::new(m, b, c)
}

fn run_synthetic(
    species: usize,
    queries: usize,
    tolerance: f64,
    max_elements: usize,
    spread: f64,
    seed: u64,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let solver = synthetic_solver(species, &mut rng);
    let config = IsatConfig::new(species, tolerance, max_elements);
    let mut cache = IsatCache::new(config, solver)?;

    let n_eq = species + 2;
    let start = Instant::now();
    for _ in 0..queries {
        let phi = DVector::from_fn(n_eq, |_, _| rng.gen_range(-spread..spread));
        cache.query_vector(&phi)?;
        cache.advance_time(1e-6);
    }
    let elapsed = start.elapsed();

    println!("{} queries in {:.3?}", queries, elapsed);
    println!(
        "{:.1} queries/ms",
        queries as f64 / elapsed.as_secs_f64() / 1e3
    );
    println!("{}", cache.stats());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_trajectory(
    species: usize,
    queries: usize,
    tolerance: f64,
    max_elements: usize,
    step: f64,
    max_2nd_search: usize,
    mru_size: usize,
    seed: u64,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let solver = synthetic_solver(species, &mut rng);
    let mut config = IsatConfig::new(species, tolerance, max_elements);
    config.max_2nd_search = max_2nd_search;
    config.mru_size = mru_size;
    let mut cache = IsatCache::new(config, solver)?;

    let n_eq = species + 2;
    let mut phi = DVector::from_element(n_eq, 0.1);
    let block = (queries / 10).max(1);
    let mut previous = cache.stats();

    let start = Instant::now();
    for i in 0..queries {
        for x in phi.iter_mut() {
            *x += rng.gen_range(-step..step);
        }
        cache.query_vector(&phi)?;
        cache.advance_time(1e-6);

        if (i + 1) % block == 0 {
            let stats = cache.stats();
            println!(
                "q {:>9}  size {:>6}  depth {:>3}  retrieves +{:>7}  grows +{:>5}  adds +{:>5}",
                i + 1,
                stats.size,
                stats.depth,
                stats.tot_retrieve - previous.tot_retrieve,
                stats.n_grow - previous.n_grow,
                stats.n_add - previous.n_add,
            );
            previous = stats;
        }
    }
    let elapsed = start.elapsed();

    println!();
    println!("{} queries in {:.3?}", queries, elapsed);
    println!("{}", cache.stats());
    Ok(())
}
