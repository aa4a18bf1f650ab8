// src/bin/rate_limiter_bench.rs

use indicatif::{ProgressBar, ProgressStyle};
use prettytable::{row, Table};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::sync::{Barrier, Semaphore};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use api_rate_limiter::config::{InMemoryConfig, LimiterConfig, RedisConfig};
use api_rate_limiter::resilience::StorageFailurePolicy;
use api_rate_limiter::storage::{MemoryStorage, RedisStorage, StorageBackend};
use api_rate_limiter::ApiRateLimiter;

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "rate_limiter_bench",
    about = "Hammer token buckets from many concurrent tasks"
)]
struct Opt {
    /// Storage backend to use
    #[structopt(short, long, possible_values = &["memory", "redis"], default_value = "memory")]
    storage: String,

    /// Redis URL (when using Redis storage)
    #[structopt(long, default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Bucket capacity
    #[structopt(short, long, default_value = "100")]
    capacity: u64,

    /// Tokens added per elapsed interval
    #[structopt(short = "a", long, default_value = "100")]
    refill_amount: u64,

    /// Refill interval in milliseconds
    #[structopt(short = "i", long, default_value = "1000")]
    refill_interval_ms: u64,

    /// Number of distinct bucket keys
    #[structopt(short = "k", long, default_value = "5")]
    num_keys: usize,

    /// Number of concurrent tasks per key
    #[structopt(short = "u", long, default_value = "10")]
    tasks_per_key: usize,

    /// Number of requests per task
    #[structopt(short = "r", long, default_value = "100")]
    requests_per_task: usize,

    /// Maximum number of in-flight checks
    #[structopt(long, default_value = "100")]
    concurrency: usize,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct KeyResult {
    allowed: u64,
    denied: u64,
    errors: u64,
}

impl KeyResult {
    fn merge(&mut self, other: KeyResult) {
        self.allowed += other.allowed;
        self.denied += other.denied;
        self.errors += other.errors;
    }

    fn total(&self) -> u64 {
        self.allowed + self.denied + self.errors
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let log_level = match opt.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "rate_limiter_bench={},api_rate_limiter={}",
            log_level, log_level
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Ctrl-C stops issuing new requests; results so far are still reported
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })?;
    }

    let config = LimiterConfig {
        capacity: opt.capacity,
        refill_amount: opt.refill_amount,
        refill_interval: Duration::from_millis(opt.refill_interval_ms),
        on_storage_error: StorageFailurePolicy::Propagate,
    };

    match opt.storage.as_str() {
        "memory" => {
            let storage = MemoryStorage::new(InMemoryConfig {
                max_entries: 100_000,
                ..InMemoryConfig::default()
            });
            run_benchmark(storage, &config, &opt, stop, "Memory").await
        }
        "redis" => {
            let redis_config = RedisConfig {
                url: opt.redis_url.clone(),
                connection_timeout: Duration::from_secs(5),
                ..RedisConfig::default()
            };
            let storage = match RedisStorage::new(redis_config).await {
                Ok(storage) => storage,
                Err(e) => {
                    error!("Failed to connect to Redis: {}", e);
                    return Err(format!("Failed to connect to Redis: {}", e).into());
                }
            };
            run_benchmark(storage, &config, &opt, stop, "Redis").await
        }
        other => Err(format!("Unknown storage backend: {}", other).into()),
    }
}

async fn run_benchmark<S>(
    storage: S,
    config: &LimiterConfig,
    opt: &Opt,
    stop: Arc<AtomicBool>,
    backend: &str,
) -> Result<(), Box<dyn std::error::Error>>
where
    S: StorageBackend + 'static,
{
    let limiter = Arc::new(ApiRateLimiter::new(storage, config)?);
    let keys: Vec<String> = (0..opt.num_keys).map(|i| format!("bench_key_{}", i)).collect();

    for key in &keys {
        limiter.reset(key).await?;
    }

    let total_requests = (opt.num_keys * opt.tasks_per_key * opt.requests_per_task) as u64;
    let progress = ProgressBar::new(total_requests);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec})")?,
    );

    info!(backend, keys = opt.num_keys, total_requests, "Starting benchmark");

    let task_count = opt.num_keys * opt.tasks_per_key;
    let barrier = Arc::new(Barrier::new(task_count));
    let semaphore = Arc::new(Semaphore::new(opt.concurrency.max(1)));
    let mut handles = Vec::with_capacity(task_count);

    let started = Instant::now();
    for key_index in 0..opt.num_keys {
        for _ in 0..opt.tasks_per_key {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);
            let semaphore = Arc::clone(&semaphore);
            let stop = Arc::clone(&stop);
            let progress = progress.clone();
            let key = keys[key_index].clone();
            let requests = opt.requests_per_task;

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let mut result = KeyResult::default();

                for _ in 0..requests {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(_permit) = semaphore.acquire().await else {
                        break;
                    };

                    match limiter.try_consume(&key).await {
                        Ok(true) => result.allowed += 1,
                        Ok(false) => result.denied += 1,
                        Err(e) => {
                            warn!(key = %key, error = %e, "Rate limit check failed");
                            result.errors += 1;
                        }
                    }
                    progress.inc(1);
                }

                (key_index, result)
            }));
        }
    }

    let mut per_key = vec![KeyResult::default(); opt.num_keys];
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok((key_index, result)) => per_key[key_index].merge(result),
            Err(e) => error!(error = %e, "Benchmark task panicked"),
        }
    }
    let elapsed = started.elapsed();
    progress.finish_and_clear();

    if stop.load(Ordering::SeqCst) {
        println!("Interrupted, partial results:");
    }
    print_report(backend, &keys, &per_key, elapsed);
    Ok(())
}

fn print_report(backend: &str, keys: &[String], per_key: &[KeyResult], elapsed: Duration) {
    let mut table = Table::new();
    table.add_row(row!["Key", "Requests", "Allowed", "Denied", "Errors", "Req/sec"]);

    let mut overall = KeyResult::default();
    for (key, result) in keys.iter().zip(per_key) {
        overall.merge(*result);
        table.add_row(row![
            key,
            result.total(),
            result.allowed,
            result.denied,
            result.errors,
            format!("{:.2}", result.total() as f64 / elapsed.as_secs_f64())
        ]);
    }
    table.add_row(row![
        b->"Total",
        b->overall.total(),
        b->overall.allowed,
        b->overall.denied,
        b->overall.errors,
        b->format!("{:.2}", overall.total() as f64 / elapsed.as_secs_f64())
    ]);

    println!("\nBenchmark results ({} storage, {:?}):", backend, elapsed);
    table.printstd();
}
