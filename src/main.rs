//! replica-sim: runs a batch of repository simulations and prints a summary
//!
//! Usage: `replica-sim [SEEDS] [default|baseline|chaos|faults|delete]`
//!
//! Logging follows `PoolConfig` (file in `POOL_CONFIG`, env overrides). When
//! a configuration file is given, its `[repository]` section sets the
//! simulated pool size and abort policy.

use replica_pool::config::PoolConfig;
use replica_pool::observability::init_tracing;
use replica_pool::repository::{
    run_repository_dst_batch, summarize_repository_dst_batch, RepositoryDSTConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> ExitCode {
    let config_path = std::env::var("POOL_CONFIG").ok().map(PathBuf::from);
    let config = match PoolConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging);

    let mut args = std::env::args().skip(1);
    let seeds: u64 = match args.next().map(|s| s.parse()) {
        None => 100,
        Some(Ok(n)) => n,
        Some(Err(e)) => {
            eprintln!("Invalid seed count: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let dst_config = match args.next().as_deref() {
        None | Some("default") => RepositoryDSTConfig::default(),
        Some("baseline") => RepositoryDSTConfig::baseline(),
        Some("chaos") => RepositoryDSTConfig::chaos(),
        Some("faults") => RepositoryDSTConfig::storage_faults(),
        Some("delete") => RepositoryDSTConfig::delete_on_abort(),
        Some(other) => {
            eprintln!(
                "Unknown scenario {} (default|baseline|chaos|faults|delete)",
                other
            );
            return ExitCode::FAILURE;
        }
    };
    let dst_config = if config_path.is_some() {
        dst_config.with_repository(&config.repository)
    } else {
        dst_config
    };
    info!(
        "Simulating {} seeds: {} bytes, {:?} on abort",
        seeds, dst_config.total_space, dst_config.abort_policy
    );

    println!("=== Replica Repository Simulation ===\n");
    let results = run_repository_dst_batch(0..seeds, dst_config);
    println!("{}", summarize_repository_dst_batch(&results));

    if results.iter().all(|r| r.passed) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
