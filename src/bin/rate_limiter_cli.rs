// src/bin/rate_limiter_cli.rs

use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use api_rate_limiter::config::{InMemoryConfig, LimiterConfig};
use api_rate_limiter::resilience::StorageFailurePolicy;
use api_rate_limiter::storage::MemoryStorage;
use api_rate_limiter::ApiRateLimiter;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rate_limiter_cli",
    about = "Simulate request patterns against one token bucket"
)]
struct Opt {
    /// Key of the bucket to draw from
    #[structopt(short, long, default_value = "someUniqueKey1")]
    key: String,

    /// Bucket capacity
    #[structopt(short, long, default_value = "3")]
    capacity: u64,

    /// Tokens added per elapsed interval
    #[structopt(short = "a", long, default_value = "3")]
    refill_amount: u64,

    /// Refill interval in milliseconds
    #[structopt(short = "i", long, default_value = "5000")]
    refill_interval_ms: u64,

    /// Simulation mode
    #[structopt(long, possible_values = &["burst", "steady"], default_value = "burst")]
    simulation: String,

    /// Number of requests to simulate
    #[structopt(short = "n", long, default_value = "10")]
    num_requests: usize,

    /// Time between requests in milliseconds (steady mode)
    #[structopt(short = "t", long, default_value = "1000")]
    request_interval_ms: u64,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Disable logs
    #[structopt(long)]
    disable_logs: bool,
}

#[derive(Debug, Default)]
struct Tally {
    allowed: usize,
    denied: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let log_level = match (opt.disable_logs, opt.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "rate_limiter_cli={},api_rate_limiter={}",
            log_level, log_level
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = LimiterConfig {
        capacity: opt.capacity,
        refill_amount: opt.refill_amount,
        refill_interval: Duration::from_millis(opt.refill_interval_ms),
        on_storage_error: StorageFailurePolicy::Propagate,
    };
    let limiter = ApiRateLimiter::new(MemoryStorage::new(InMemoryConfig::default()), &config)?;

    info!(
        key = %opt.key,
        capacity = opt.capacity,
        refill_amount = opt.refill_amount,
        refill_interval_ms = opt.refill_interval_ms,
        "Starting {} simulation",
        opt.simulation
    );

    let pause = match opt.simulation.as_str() {
        "steady" => Duration::from_millis(opt.request_interval_ms),
        _ => Duration::ZERO,
    };

    let started = Instant::now();
    let tally = simulate(&opt, &limiter, pause).await?;
    let elapsed = started.elapsed();

    println!("\n{} simulation results:", opt.simulation);
    println!("-------------------------");
    println!("Total requests: {}", opt.num_requests);
    println!("Allowed: {}", tally.allowed);
    println!("Denied: {}", tally.denied);
    println!("Time elapsed: {:?}", elapsed);

    Ok(())
}

async fn simulate(
    opt: &Opt,
    limiter: &ApiRateLimiter<MemoryStorage>,
    pause: Duration,
) -> Result<Tally, Box<dyn std::error::Error>> {
    let mut tally = Tally::default();

    for i in 0..opt.num_requests {
        let request_time = Instant::now();
        let probe = limiter.check(&opt.key).await?;

        if probe.consumed {
            tally.allowed += 1;
            println!("Request {}: ALLOWED (remaining: {})", i + 1, probe.remaining_tokens);
        } else {
            tally.denied += 1;
            warn!(request = i + 1, "Request rejected");
            println!(
                "Request {}: DENIED (next refill in {:?})",
                i + 1,
                probe.wait_for_refill
            );
        }

        let elapsed = request_time.elapsed();
        if elapsed < pause {
            time::sleep(pause - elapsed).await;
        }
    }

    Ok(tally)
}
