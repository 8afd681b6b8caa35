use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{
    AtomicScript, CallOutcome, Clock, DegradationContext, DegradationFallback, DegradationReason,
    Downstream, DownstreamError, FallbackDisposition, Limit, ManualClock, MemoryStore,
    QuotaGuardError, RateLimitEngine, RateLimitEngineOptions, RateLimitKey, RatePerSecond,
    StoreClient, StoreFailurePolicy, WindowSizeSeconds,
};

/// Aligned to every window length used in the tests.
pub(super) const START_MS: u64 = 1_700_000_000_000;

pub(super) fn key(s: &str) -> RateLimitKey {
    RateLimitKey::try_from(s).unwrap()
}

pub(super) fn limit(n: u64) -> Limit {
    Limit::try_from(n).unwrap()
}

pub(super) fn window(seconds: u64) -> WindowSizeSeconds {
    WindowSizeSeconds::try_from(seconds).unwrap()
}

pub(super) fn rate(per_second: f64) -> RatePerSecond {
    RatePerSecond::try_from(per_second).unwrap()
}

pub(super) fn manual_engine() -> (Arc<ManualClock>, RateLimitEngine<MemoryStore>) {
    let clock = Arc::new(ManualClock::new(START_MS));
    (clock.clone(), engine_on(clock))
}

pub(super) fn engine_on(clock: Arc<dyn Clock>) -> RateLimitEngine<MemoryStore> {
    RateLimitEngine::new(
        MemoryStore::with_clock(clock.clone()),
        RateLimitEngineOptions {
            clock,
            ..Default::default()
        },
    )
    .unwrap()
}

/// Epoch clock driven by tokio's (pausable) timer.
#[derive(Debug)]
pub(super) struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub(super) fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        START_MS + self.origin.elapsed().as_millis() as u64
    }
}

/// Downstream replaying a fixed sequence of results, then a default one.
#[derive(Debug)]
pub(super) struct ScriptedDownstream {
    script: Mutex<VecDeque<Result<(), DownstreamError>>>,
    otherwise: Result<(), DownstreamError>,
    calls: AtomicU64,
}

impl ScriptedDownstream {
    pub(super) fn new(
        script: Vec<Result<(), DownstreamError>>,
        otherwise: Result<(), DownstreamError>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            otherwise,
            calls: AtomicU64::new(0),
        }
    }

    pub(super) fn healthy() -> Self {
        Self::new(vec![], Ok(()))
    }

    pub(super) fn failing() -> Self {
        Self::new(vec![], Err(DownstreamError::Failure("boom".to_string())))
    }

    pub(super) fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Downstream for ScriptedDownstream {
    async fn call(&self, _payload: &str) -> Result<(), DownstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.otherwise.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Degraded {
    pub(super) reason: DegradationReason,
    pub(super) attempts: u32,
    pub(super) last_outcome: Option<CallOutcome>,
}

/// Fallback that records every degraded message.
#[derive(Debug)]
pub(super) struct RecordingFallback {
    disposition: FallbackDisposition,
    seen: Arc<Mutex<Vec<Degraded>>>,
}

impl RecordingFallback {
    pub(super) fn new(disposition: FallbackDisposition) -> (Self, Arc<Mutex<Vec<Degraded>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                disposition,
                seen: seen.clone(),
            },
            seen,
        )
    }
}

impl DegradationFallback for RecordingFallback {
    async fn degrade(&self, context: &DegradationContext<'_>) -> FallbackDisposition {
        self.seen.lock().unwrap().push(Degraded {
            reason: context.reason,
            attempts: context.attempts,
            last_outcome: context.last_outcome,
        });
        self.disposition
    }
}

/// Store that is always unreachable.
#[derive(Debug, Clone, Default)]
pub(super) struct UnreachableStore;

fn unreachable_store() -> QuotaGuardError {
    QuotaGuardError::StoreUnavailable("connection refused".to_string())
}

impl StoreClient for UnreachableStore {
    async fn atomic_script(&self, _script: &AtomicScript) -> Result<i64, QuotaGuardError> {
        Err(unreachable_store())
    }

    async fn increment(&self, _key: &str) -> Result<i64, QuotaGuardError> {
        Err(unreachable_store())
    }

    async fn expire(&self, _key: &str, _ttl_seconds: u64) -> Result<bool, QuotaGuardError> {
        Err(unreachable_store())
    }

    async fn delete(&self, _key: &str) -> Result<bool, QuotaGuardError> {
        Err(unreachable_store())
    }

    async fn zcard(&self, _key: &str) -> Result<u64, QuotaGuardError> {
        Err(unreachable_store())
    }

    async fn hash_get(&self, _key: &str, _field: &str) -> Result<Option<String>, QuotaGuardError> {
        Err(unreachable_store())
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, QuotaGuardError> {
        Err(unreachable_store())
    }
}

pub(super) fn unreachable_engine(
    failure_policy: StoreFailurePolicy,
) -> RateLimitEngine<UnreachableStore> {
    RateLimitEngine::new(
        UnreachableStore,
        RateLimitEngineOptions {
            failure_policy,
            ..Default::default()
        },
    )
    .unwrap()
}

/// Poll `condition` every 10 ms for up to 10 s of (possibly paused) time.
pub(super) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("condition not reached in time");
}
