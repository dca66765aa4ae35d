//! codelet-rt - machine inspection and synthetic benchmark

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

use codelet_rt::runtime::memory::{BusLink, MemoryNode};
use codelet_rt::runtime::{StatsSnapshot, WorkerDescription};
use codelet_rt::util::logger::{self, LogLevel};
use codelet_rt::{Buffers, Codelet, KernelResult, PolicyKind, Runtime, RuntimeConfig, TaskBuilder, NAME, VERSION};

/// Heterogeneous task runtime
#[derive(Parser, Debug)]
#[command(name = "codelet-rt")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// RON configuration file (environment overrides still apply)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show memory nodes, workers and the bus table
    Machine {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run a synthetic tiled workload and print statistics
    Bench {
        /// Number of tiles
        #[arg(long, default_value_t = 16)]
        tiles: usize,

        /// Elements per tile
        #[arg(long, default_value_t = 4096)]
        tile_size: usize,

        /// Passes over every tile
        #[arg(long, default_value_t = 8)]
        iterations: usize,

        /// Scheduling policy, overriding the configuration
        #[arg(long)]
        policy: Option<PolicyKind>,

        /// Seed for the tile contents
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config: {}", path.display())),
        None => RuntimeConfig::from_env().context("Invalid environment override"),
    }
}

#[derive(Serialize)]
struct MachineReport {
    nodes: Vec<MemoryNode>,
    workers: Vec<WorkerDescription>,
    bus: Vec<Vec<BusLink>>,
}

fn machine(
    config: RuntimeConfig,
    json: bool,
) -> Result<()> {
    let rt = Runtime::new(config).context("Failed to start runtime")?;
    let nodes = rt.nodes();
    let report = MachineReport {
        nodes: nodes.iter().cloned().collect(),
        workers: rt.workers(),
        bus: nodes
            .iter()
            .map(|src| nodes.iter().map(|dst| nodes.link(src.id, dst.id)).collect())
            .collect(),
    };
    rt.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Memory nodes:");
    for node in &report.nodes {
        let capacity = node
            .capacity
            .map(|c| format!("{c} bytes"))
            .unwrap_or_else(|| "unbounded".to_string());
        println!("  {} {:<10} {:?} ({})", node.id, node.name, node.kind, capacity);
    }
    println!("Workers:");
    for worker in &report.workers {
        println!("  {} {:<10} on {}", worker.id, worker.name, worker.node);
    }
    println!("Bus (latency us / bandwidth bytes per us):");
    for (src, row) in report.bus.iter().enumerate() {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(dst, link)| {
                if src == dst {
                    "-".to_string()
                } else {
                    format!("{:.1}/{:.0}", link.latency_us, link.bandwidth)
                }
            })
            .collect();
        println!("  node{src}: {}", cells.join("  "));
    }
    Ok(())
}

#[derive(Serialize)]
struct BenchReport {
    policy: String,
    tiles: usize,
    tile_size: usize,
    iterations: usize,
    elapsed_ms: f64,
    stats: StatsSnapshot,
}

/// `y = a*x + y` then `x = x * 0.5` on every tile, `iterations` times.
fn bench(
    mut config: RuntimeConfig,
    tiles: usize,
    tile_size: usize,
    iterations: usize,
    policy: Option<PolicyKind>,
    seed: u64,
    json: bool,
) -> Result<()> {
    if let Some(policy) = policy {
        config.scheduler.policy = policy;
    }
    let policy = config.scheduler.policy;
    let rt = Runtime::new(config).context("Failed to start runtime")?;

    let axpy_kernel = |bufs: &mut Buffers<'_>, args: &[u8]| -> KernelResult {
        let a = f32::from_le_bytes([args[0], args[1], args[2], args[3]]);
        let (y, x) = bufs.pair_mut(1, 0);
        for i in 0..x.len::<f32>() {
            let v: f32 = y.get(i);
            y.set(i, v + a * x.get::<f32>(i));
        }
        Ok(())
    };
    let axpy = Arc::new(Codelet::new("axpy").nbuffers(2).cpu(axpy_kernel).cuda(axpy_kernel));
    let halve_kernel = |bufs: &mut Buffers<'_>, _: &[u8]| -> KernelResult {
        let x = bufs.get_mut(0);
        for i in 0..x.len::<f32>() {
            let v: f32 = x.get(i);
            x.set(i, v * 0.5);
        }
        Ok(())
    };
    let halve = Arc::new(Codelet::new("halve").nbuffers(1).cpu(halve_kernel).cuda(halve_kernel));

    let mut rng = StdRng::seed_from_u64(seed);
    let tile = |rng: &mut StdRng| -> Vec<f32> { (0..tile_size).map(|_| rng.random_range(-1.0f32..1.0)).collect() };
    let xs = (0..tiles)
        .map(|_| rt.register_vector(&tile(&mut rng)))
        .collect::<codelet_rt::Result<Vec<_>>>()?;
    let ys = (0..tiles)
        .map(|_| rt.register_vector(&tile(&mut rng)))
        .collect::<codelet_rt::Result<Vec<_>>>()?;

    info!(tiles, tile_size, iterations, %policy, "bench started");
    let start = Instant::now();
    for _ in 0..iterations {
        for (x, y) in xs.iter().zip(&ys) {
            rt.submit(TaskBuilder::new(&axpy).read(x).read_write(y).scalar_args(&[2.0f32]))?;
            rt.submit(TaskBuilder::new(&halve).read_write(x))?;
        }
    }
    rt.wait_for_all();
    let elapsed = start.elapsed();

    for handle in xs.iter().chain(&ys) {
        rt.unregister(handle)?;
    }
    let report = BenchReport {
        policy: policy.to_string(),
        tiles,
        tile_size,
        iterations,
        elapsed_ms: elapsed.as_secs_f64() * 1e3,
        stats: rt.stats(),
    };
    rt.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    let s = &report.stats;
    println!("policy:           {}", report.policy);
    println!("jobs:             {} submitted, {} completed, {} retried", s.submitted, s.completed, s.retried);
    println!("elapsed:          {:.2} ms", report.elapsed_ms);
    println!("kernel time:      {} us", s.total_exec_time_us);
    println!("peak parallelism: {}", s.peak_parallelism);
    println!("transfers:        {} ({} bytes)", s.transfers, s.transferred_bytes);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        logger::init_with_level(LogLevel::Debug);
    } else {
        logger::init_with_level(logger::level_from_env().unwrap_or(LogLevel::Warn));
    }

    let config = load_config(args.config.as_ref())?;
    match args.command {
        Commands::Machine { json } => machine(config, json)?,
        Commands::Bench {
            tiles,
            tile_size,
            iterations,
            policy,
            seed,
            json,
        } => bench(config, tiles, tile_size, iterations, policy, seed, json)?,
    }

    Ok(())
}
