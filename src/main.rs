use std::sync::Arc;
use std::thread;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use timewarp::accel::{Accelerator, CpuAccelerator};
use timewarp::models::{Phold, PholdConfig, Seir, SeirConfig};
use timewarp::{KernelResult, SimulationBuilder, SimulationStats};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run() {
        error!(error = %e, fatal = e.is_fatal(), "Simulation failed");
        std::process::exit(1);
    }
}

fn run() -> KernelResult<()> {
    // ── PHOLD over two in-memory processes ────────────────────
    let phold = Phold::new(PholdConfig {
        width: 8,
        height: 8,
        ..PholdConfig::default()
    });
    let sims = SimulationBuilder::new()
        .end_time(200)
        .gvt_period(32)
        .phold(&phold)
        .build_cluster(2)?;
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = sims
            .into_iter()
            .map(|mut sim| scope.spawn(move || sim.run().map(|stats| (stats, sim.state_hash()))))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });
    for result in results {
        let (stats, hash) = result?;
        report("phold", &stats, hash);
    }

    // ── SEIR with batched offload ─────────────────────────────
    let seir = Seir::new(SeirConfig {
        locations: 32,
        ..SeirConfig::default()
    })?;
    let accel: Arc<dyn Accelerator> = Arc::new(CpuAccelerator::new(0)?);
    let mut sim = SimulationBuilder::new()
        .end_time(100)
        .batch_capacity(16)
        .offload(accel, seir.kernel().clone(), true)
        .seir(&seir)
        .build()?;
    let stats = sim.run()?;
    let hash = sim.state_hash();
    report("seir", &stats, hash);
    Ok(())
}

fn report(model: &str, stats: &SimulationStats, hash: u64) {
    info!(model, %stats, state_hash = %format!("{hash:016x}"), "Run complete");
}
