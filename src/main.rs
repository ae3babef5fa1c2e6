use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xxhash_rust::xxh3::xxh3_64;

use mqf::{Cqf, CqfParams, LockMode};

#[derive(Parser, Debug)]
#[command(name = "mqf")]
#[command(about = "Build, benchmark and inspect counting quotient filters")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parallel insert throughput and false-positive rate
    Bench {
        /// log2 of the number of slots
        #[arg(short, long, default_value = "20")]
        log_slots: u64,

        /// Fraction of the slots to fill
        #[arg(short, long, default_value = "0.9")]
        fill: f64,

        /// Back the filter with this file instead of memory
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Fill a new file-backed filter with random keys
    Build {
        path: PathBuf,

        #[arg(short, long, default_value = "16")]
        log_slots: u64,

        /// Number of keys to insert
        #[arg(short, long, default_value = "10000")]
        keys: u64,

        #[arg(long, default_value = "8")]
        counter_bits: u64,

        #[arg(long, default_value = "0")]
        seed: u64,
    },
    /// Print the metadata of a serialized filter
    Inspect { path: PathBuf },
}

fn bench(log_slots: u64, fill: f64, file: Option<PathBuf>) -> anyhow::Result<()> {
    if !(0.0..=0.95).contains(&fill) {
        bail!("fill must be within 0..=0.95, got {fill}");
    }
    let mut params = CqfParams::new(1 << log_slots, (log_slots + 8).min(64));
    if let Some(path) = file {
        params = params.in_file(path);
    }
    let qf = Cqf::new(params).context("failed to make cqf")?;
    let n_keys = ((1u64 << log_slots) as f64 * fill) as u64;
    let hashes: Vec<u64> = (0..n_keys).map(|n| xxh3_64(&n.to_le_bytes())).collect();

    let now = Instant::now();
    hashes
        .par_iter()
        .try_for_each(|&hash| qf.insert_by_hash(hash, 1, LockMode::SPIN))
        .context("insert failed")?;
    let elapsed = now.elapsed();
    println!(
        "inserted {n_keys} keys on {} threads in {:?} ({:.1} Mops/s)",
        rayon::current_num_threads(),
        elapsed,
        n_keys as f64 / elapsed.as_secs_f64() / 1e6
    );

    let now = Instant::now();
    let missing = hashes.par_iter().filter(|&&hash| qf.query_by_hash(hash) == 0).count();
    if missing > 0 {
        bail!("{missing} false negatives");
    }
    println!("queried {n_keys} keys in {:?}", now.elapsed());

    let false_positives = (n_keys..2 * n_keys)
        .into_par_iter()
        .filter(|n| qf.query_by_hash(xxh3_64(&n.to_le_bytes())) > 0)
        .count();
    println!(
        "false positive rate {:.6} over {n_keys} absent keys",
        false_positives as f64 / n_keys.max(1) as f64
    );
    let stats = qf.total_lock_stats();
    println!(
        "lock acquisitions {}, first-try {}, spin {:?}",
        stats.acquisitions,
        stats.single_attempt,
        std::time::Duration::from_nanos(stats.spin_nanos)
    );
    Ok(())
}

fn build(path: PathBuf, log_slots: u64, keys: u64, counter_bits: u64, seed: u64) -> anyhow::Result<()> {
    let key_bits = (log_slots + 16).min(64);
    let qf = Cqf::new(
        CqfParams::new(1 << log_slots, key_bits)
            .with_fixed_counter_bits(counter_bits)
            .with_seed(seed)
            .in_file(&path),
    )
    .with_context(|| format!("failed to create {}", path.display()))?;
    let mut rng = StdRng::seed_from_u64(seed);
    let max_key = if key_bits == 64 { u64::MAX } else { (1 << key_bits) - 1 };
    for _ in 0..keys {
        let key = rng.gen_range(0..=max_key);
        qf.insert(key, rng.gen_range(1..=4), LockMode::NONE)?;
    }
    qf.sync()?;
    info!(path = %path.display(), nelts = qf.nelts(), "built filter");
    println!("{:#?}", qf.metadata());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Args::parse().command {
        Command::Bench {
            log_slots,
            fill,
            file,
        } => bench(log_slots, fill, file),
        Command::Build {
            path,
            log_slots,
            keys,
            counter_bits,
            seed,
        } => build(path, log_slots, keys, counter_bits, seed),
        Command::Inspect { path } => {
            let qf = Cqf::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
            println!("{:#?}", qf.metadata());
            println!("space used: {}%", qf.space());
            Ok(())
        }
    }
}
