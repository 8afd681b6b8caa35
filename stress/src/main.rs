use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;
use tracing_subscriber::EnvFilter;

use quotaguard::{
    AdmissionPolicy, Algorithm, Backoff, BreakerConfig, Clock, ConsumptionLoop,
    ConsumptionLoopOptions, Delivery, Downstream, DownstreamError, InMemoryTransport,
    InMemoryTransportOptions, Limit, LocalQuotaSimulator, LocalQuotaSimulatorOptions, LogAndDefer,
    MemoryStore, MessageHandler, QuotaGuardError, RateLimitEngine, RateLimitEngineOptions,
    RateLimitKey, RatePerSecond, ResilienceOptions, RetryPolicy, Shutdown, StoreClient,
    Subscription, SystemClock, WindowSizeSeconds,
};

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Store {
    /// In-process store shared by all loops.
    Memory,
    /// Redis, as several processes would share it.
    Redis,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum AlgorithmArg {
    Sliding,
    Token,
    Fixed,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Admission {
    /// Bounded retry loop with fixed backoff.
    Retry,
    /// Poll until admitted or the timeout elapses.
    Blocking,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "quotaguard-stress",
    about = "Runs many consumption loops against one store and checks the downstream ceiling"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = Store::Memory)]
    store: Store,

    #[arg(long, value_enum, default_value_t = AlgorithmArg::Sliding)]
    algorithm: AlgorithmArg,

    #[arg(long, value_enum, default_value_t = Admission::Retry)]
    admission: Admission,

    /// Consumption loops, each with its own circuit breaker.
    #[arg(long, default_value_t = 4)]
    loops: usize,

    /// Workers per loop.
    #[arg(long, default_value_t = 2)]
    concurrency: usize,

    #[arg(long, default_value_t = 200)]
    messages: usize,

    /// Admissions per window (bucket capacity for the token bucket).
    #[arg(long, default_value_t = 5)]
    limit: u64,

    #[arg(long, default_value_t = 1)]
    window_s: u64,

    /// Token bucket refill rate.
    #[arg(long, default_value_t = 5.0)]
    rate_per_s: f64,

    /// Calls per second the simulated downstream accepts.
    #[arg(long, default_value_t = 5)]
    ceiling: u64,

    #[arg(long, default_value_t = 100)]
    latency_ms: u64,

    #[arg(long, default_value_t = 50)]
    max_attempts: u32,

    #[arg(long, default_value_t = 200)]
    backoff_ms: u64,

    #[arg(long, default_value_t = 300)]
    timeout_s: u64,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,

    #[arg(long, default_value = "stress")]
    redis_prefix: String,
}

/// Simulated downstream that remembers when each accepted call started.
#[derive(Debug)]
struct ObservedDownstream {
    simulator: LocalQuotaSimulator,
    clock: SystemClock,
    accepted_at_ms: Mutex<Vec<u64>>,
}

impl Downstream for ObservedDownstream {
    async fn call(&self, payload: &str) -> Result<(), DownstreamError> {
        let started_ms = self.clock.now_ms();
        let result = self.simulator.call(payload).await;

        if result.is_ok() {
            self.accepted_at_ms
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(started_ms);
        }

        result
    }
}

/// Records how long each message spent in its handler.
struct TimedHandler<H> {
    inner: Arc<H>,
    latency_us: Arc<Mutex<Histogram<u64>>>,
}

impl<H: MessageHandler> MessageHandler for TimedHandler<H> {
    async fn handle(&self, topic: &str, payload: &str) -> Result<Delivery, QuotaGuardError> {
        let started = Instant::now();
        let delivery = self.inner.handle(topic, payload).await;

        let us = started.elapsed().as_micros() as u64;
        let _ = self
            .latency_us
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(us.max(1));

        delivery
    }
}

fn build_algorithm(args: &Args) -> Result<Algorithm, QuotaGuardError> {
    let limit = Limit::try_from(args.limit)?;
    let window = WindowSizeSeconds::try_from(args.window_s)?;

    Ok(match args.algorithm {
        AlgorithmArg::Sliding => Algorithm::SlidingWindow { limit, window },
        AlgorithmArg::Token => Algorithm::TokenBucket {
            capacity: limit,
            rate: RatePerSecond::try_from(args.rate_per_s)?,
        },
        AlgorithmArg::Fixed => Algorithm::FixedWindow { limit, window },
    })
}

fn build_admission(args: &Args) -> AdmissionPolicy {
    match args.admission {
        Admission::Retry => AdmissionPolicy::RetryLoop(RetryPolicy {
            max_attempts: args.max_attempts,
            backoff: Backoff::fixed(Duration::from_millis(args.backoff_ms)),
        }),
        Admission::Blocking => AdmissionPolicy::blocking(),
    }
}

/// Largest number of timestamps within any `window_ms` span.
fn max_in_any_window(sorted_ms: &[u64], window_ms: u64) -> usize {
    let mut start = 0;
    let mut best = 0;

    for end in 0..sorted_ms.len() {
        while sorted_ms[end] - sorted_ms[start] >= window_ms {
            start += 1;
        }
        best = best.max(end - start + 1);
    }

    best
}

async fn run<S: StoreClient + 'static>(
    args: &Args,
    engine: RateLimitEngine<S>,
) -> Result<bool, QuotaGuardError> {
    let engine = Arc::new(engine);
    let downstream = Arc::new(ObservedDownstream {
        simulator: LocalQuotaSimulator::new(LocalQuotaSimulatorOptions {
            max_calls_per_second: args.ceiling,
            latency: Duration::from_millis(args.latency_ms),
            ..Default::default()
        })?,
        clock: SystemClock,
        accepted_at_ms: Mutex::new(Vec::new()),
    });

    let (trigger, shutdown) = Shutdown::channel();
    let transport = InMemoryTransport::new(
        InMemoryTransportOptions {
            channel_capacity: args.messages.max(1),
            redelivery_delay: Duration::from_millis(500),
            max_redeliveries: 100,
        },
        shutdown.clone(),
    );

    let latency_us = Arc::new(Mutex::new(
        Histogram::<u64>::new_with_bounds(1, 600_000_000, 3)
            .map_err(|err| QuotaGuardError::InvalidConfiguration(err.to_string()))?,
    ));

    let key = RateLimitKey::try_from("stress_downstream")?;
    let subscription = Subscription::new("stress", "stress-consumers", args.concurrency)?;
    let algorithm = build_algorithm(args)?;

    let mut workers = Vec::with_capacity(args.loops);
    for _ in 0..args.loops {
        let consumer = ConsumptionLoop::new(
            ConsumptionLoopOptions {
                subscription: subscription.clone(),
                key: key.clone(),
                resilience: ResilienceOptions {
                    algorithm,
                    admission: build_admission(args),
                    breaker: BreakerConfig::default(),
                },
            },
            Arc::clone(&engine),
            Arc::clone(&downstream),
            LogAndDefer,
            shutdown.clone(),
        )?;

        let handler = Arc::new(TimedHandler {
            inner: Arc::new(consumer),
            latency_us: Arc::clone(&latency_us),
        });
        workers.push(transport.subscribe(&subscription, handler));
    }

    let started = Instant::now();
    for i in 0..args.messages {
        transport.publish("stress", &format!("message-{i}")).await?;
    }

    let deadline = started + Duration::from_secs(args.timeout_s);
    loop {
        let stats = transport.stats();
        let settled = stats.acked() + stats.dropped() + stats.dead_lettered();

        if settled >= args.messages as u64 || Instant::now() >= deadline {
            break;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let elapsed = started.elapsed();
    trigger.trigger();
    for worker in workers {
        worker.join().await;
    }

    engine.reset(&key).await?;

    let mut accepted_at_ms = downstream
        .accepted_at_ms
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone();
    accepted_at_ms.sort_unstable();

    let stats = transport.stats();
    let peak = max_in_any_window(&accepted_at_ms, 1000);
    let rejected_by_downstream = downstream.simulator.rate_limited_calls();

    println!(
        "store={:?} algorithm={:?} admission={:?} loops={} concurrency={}",
        args.store, args.algorithm, args.admission, args.loops, args.concurrency
    );
    println!(
        "messages={} elapsed_s={:.3} calls_per_s={:.2}",
        args.messages,
        elapsed.as_secs_f64(),
        accepted_at_ms.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "acked={} dropped={} redelivered={} dead_lettered={} handler_errors={}",
        stats.acked(),
        stats.dropped(),
        stats.redelivered(),
        stats.dead_lettered(),
        stats.handler_errors()
    );
    println!(
        "ceiling={} peak_calls_in_any_1s={} downstream_rate_limited={}",
        args.ceiling, peak, rejected_by_downstream
    );

    let hist = latency_us
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if !hist.is_empty() {
        println!(
            "handler_lat_us p50={} p95={} p99={} max={}",
            hist.value_at_quantile(0.50),
            hist.value_at_quantile(0.95),
            hist.value_at_quantile(0.99),
            hist.max()
        );
    }

    Ok(rejected_by_downstream == 0)
}

#[cfg(feature = "redis-tokio")]
async fn redis_engine(
    args: &Args,
    options: RateLimitEngineOptions,
) -> Result<RateLimitEngine<quotaguard::RedisStore>, QuotaGuardError> {
    let client = redis::Client::open(args.redis_url.as_str())?;
    let store = quotaguard::RedisStore::from_client(client, args.loops.max(1)).await?;

    RateLimitEngine::new(store, options)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let options = RateLimitEngineOptions {
        prefix: Some(args.redis_prefix.clone()),
        ..Default::default()
    };

    let result = match args.store {
        Store::Memory => match RateLimitEngine::new(MemoryStore::new(), options) {
            Ok(engine) => run(&args, engine).await,
            Err(err) => Err(err),
        },
        #[cfg(feature = "redis-tokio")]
        Store::Redis => {
            match redis_engine(&args, options).await {
                Ok(engine) => run(&args, engine).await,
                Err(err) => Err(err),
            }
        }
        #[cfg(not(feature = "redis-tokio"))]
        Store::Redis => Err(QuotaGuardError::InvalidConfiguration(
            "built without the redis-tokio feature".to_string(),
        )),
    };

    match result {
        Ok(true) => {}
        Ok(false) => {
            eprintln!("downstream ceiling exceeded");
            std::process::exit(1);
        }
        Err(err) => {
            tracing::error!(error = ?err, "stress run failed");
            std::process::exit(2);
        }
    }
}
