//! VibeTxn - concurrent bank-transfer workload over the MVCC engine

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser as ClapParser;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vibetxn::concurrency::{IsolationLevel, LockId, LockMode};
use vibetxn::transaction::{
    TransactionError, TransactionHandle, TransactionManager, TransactionManagerConfig,
};

/// VibeTxn - runs concurrent transfers between accounts and checks that
/// no money appears or disappears
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Isolation level used by every transfer
    #[arg(short, long, default_value = "SERIALIZABLE")]
    isolation: IsolationLevel,

    /// Number of concurrent workers
    #[arg(short, long, default_value = "4")]
    workers: usize,

    /// Transfers per worker
    #[arg(short, long, default_value = "250")]
    transfers: usize,

    /// Number of accounts
    #[arg(short, long, default_value = "10")]
    accounts: usize,

    /// Starting balance of every account
    #[arg(short = 'b', long, default_value = "1000")]
    initial_balance: i64,

    /// Seed for account and amount selection
    #[arg(short, long)]
    seed: Option<u64>,

    /// Retries per transfer before giving up
    #[arg(short = 'r', long, default_value = "20")]
    max_retries: u32,

    /// Disable write-skew detection for SERIALIZABLE
    #[arg(long)]
    no_write_skew: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy)]
struct Workload {
    accounts: usize,
    transfers: usize,
    max_retries: u32,
    max_amount: i64,
}

#[derive(Debug, Default)]
struct WorkerReport {
    committed: usize,
    insufficient: usize,
    retries: usize,
    gave_up: usize,
}

impl WorkerReport {
    fn merge(&mut self, other: WorkerReport) {
        self.committed += other.committed;
        self.insufficient += other.insufficient;
        self.retries += other.retries;
        self.gave_up += other.gave_up;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if args.accounts < 2 {
        bail!("at least two accounts are required");
    }
    if args.initial_balance < 0 {
        bail!("initial balance must not be negative");
    }

    println!("VibeTxn v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "isolation={} workers={} transfers={} accounts={}",
        args.isolation, args.workers, args.transfers, args.accounts
    );

    let config = TransactionManagerConfig {
        default_isolation: args.isolation,
        detect_write_skew: !args.no_write_skew,
        ..TransactionManagerConfig::default()
    };
    let manager = Arc::new(TransactionManager::with_config(config));
    seed_accounts(&manager, args.accounts, args.initial_balance)
        .context("Failed to seed accounts")?;
    let expected = args.initial_balance * args.accounts as i64;

    let workload = Workload {
        accounts: args.accounts,
        transfers: args.transfers,
        max_retries: args.max_retries,
        max_amount: (args.initial_balance / 10).max(1),
    };
    let base_seed = args.seed.unwrap_or_else(rand::random);
    info!("Using seed {}", base_seed);

    let started = Instant::now();
    let mut workers = Vec::with_capacity(args.workers);
    for worker in 0..args.workers {
        let manager = Arc::clone(&manager);
        let seed = base_seed.wrapping_add(worker as u64);
        workers.push(tokio::task::spawn_blocking(move || {
            run_worker(&manager, worker, workload, seed)
        }));
    }

    let mut totals = WorkerReport::default();
    for worker in workers {
        let report = worker.await.context("Worker task panicked")??;
        totals.merge(report);
    }
    let elapsed = started.elapsed();

    let vacuum = manager.vacuum();
    let total = total_balance(&manager, args.accounts).context("Failed to read balances")?;
    let stats = manager.stats();

    println!("committed transfers:    {}", totals.committed);
    println!("insufficient funds:     {}", totals.insufficient);
    println!("retries:                {}", totals.retries);
    println!("gave up:                {}", totals.gave_up);
    println!(
        "throughput:             {:.1} transfers/s",
        totals.committed as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "vacuum:                 {} versions, {} transactions removed",
        vacuum.versions_removed, vacuum.transactions_purged
    );
    println!(
        "store:                  {} chains, {} versions",
        stats.mvcc.version_chains, stats.mvcc.total_versions
    );
    println!("total balance:          {} (expected {})", total, expected);

    if total != expected {
        bail!(
            "total balance drifted under {}: expected {}, found {}",
            args.isolation,
            expected,
            total
        );
    }
    Ok(())
}

fn account_key(index: usize) -> String {
    format!("account:{}", index)
}

fn encode_balance(balance: i64) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(&balance)?))
}

fn decode_balance(payload: &Bytes) -> Result<i64> {
    bincode::deserialize(payload).context("Corrupt balance payload")
}

fn seed_accounts(manager: &TransactionManager, accounts: usize, balance: i64) -> Result<()> {
    let handle = manager.begin(IsolationLevel::ReadCommitted);
    for index in 0..accounts {
        manager.write(handle, &account_key(index), encode_balance(balance)?)?;
    }
    manager.commit(handle)?;
    Ok(())
}

fn total_balance(manager: &TransactionManager, accounts: usize) -> Result<i64> {
    let handle = manager.begin(IsolationLevel::Snapshot);
    let mut total = 0;
    for index in 0..accounts {
        total += decode_balance(&manager.read(handle, &account_key(index))?)?;
    }
    manager.commit(handle)?;
    Ok(total)
}

fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TransactionError>()
        .map_or(false, TransactionError::is_retryable)
}

fn backoff(attempt: u32, rng: &mut StdRng) -> Duration {
    let base = 50u64 << attempt.min(10);
    Duration::from_micros(base + rng.gen_range(0..=base))
}

fn run_worker(
    manager: &TransactionManager,
    worker: usize,
    workload: Workload,
    seed: u64,
) -> Result<WorkerReport> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut report = WorkerReport::default();

    for _ in 0..workload.transfers {
        let from = rng.gen_range(0..workload.accounts);
        let mut to = rng.gen_range(0..workload.accounts - 1);
        if to >= from {
            to += 1;
        }
        let amount = rng.gen_range(1..=workload.max_amount);

        let mut attempt = 0;
        loop {
            match transfer(manager, from, to, amount) {
                Ok(true) => {
                    report.committed += 1;
                    break;
                }
                Ok(false) => {
                    report.insufficient += 1;
                    break;
                }
                Err(err) if is_retryable(&err) && attempt < workload.max_retries => {
                    attempt += 1;
                    report.retries += 1;
                    debug!("Worker {} retrying transfer ({}): {}", worker, attempt, err);
                    std::thread::sleep(backoff(attempt, &mut rng));
                }
                Err(err) if is_retryable(&err) => {
                    warn!("Worker {} gave up on transfer {} -> {}: {}", worker, from, to, err);
                    report.gave_up += 1;
                    break;
                }
                Err(err) => return Err(err.context(format!("Worker {} failed", worker))),
            }
        }
    }

    info!(
        "Worker {} finished: {} committed, {} retries",
        worker, report.committed, report.retries
    );
    Ok(report)
}

/// Runs one transfer in its own transaction at the configured default
/// isolation level. Returns `false` when the source account cannot cover
/// the amount.
fn transfer(manager: &TransactionManager, from: usize, to: usize, amount: i64) -> Result<bool> {
    let handle = manager.begin_default();
    let outcome = apply_transfer(manager, handle, from, to, amount)
        .and_then(|moved| manager.commit(handle).map(|()| moved).map_err(Into::into));
    if outcome.is_err() {
        manager.abort(handle)?;
    }
    outcome
}

fn apply_transfer(
    manager: &TransactionManager,
    handle: TransactionHandle,
    from: usize,
    to: usize,
    amount: i64,
) -> Result<bool> {
    let from_key = account_key(from);
    let to_key = account_key(to);

    // Weaker levels have no write-conflict check, so serialize on the
    // accounts with explicit locks instead.
    if !handle.isolation.checks_write_conflicts() {
        manager.lock(handle, LockId::key(&from_key), LockMode::Exclusive)?;
        manager.lock(handle, LockId::key(&to_key), LockMode::Exclusive)?;
    }

    let from_balance = decode_balance(&manager.read(handle, &from_key)?)?;
    if from_balance < amount {
        return Ok(false);
    }
    let to_balance = decode_balance(&manager.read(handle, &to_key)?)?;

    manager.write(handle, &from_key, encode_balance(from_balance - amount)?)?;
    manager.write(handle, &to_key, encode_balance(to_balance + amount)?)?;
    Ok(true)
}
