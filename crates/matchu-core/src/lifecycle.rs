//! Lazy, failure-backoff lifecycle of the shared recognition engine.
//!
//! The engine is built on first use. A failed build is remembered for
//! `retry_interval`; callers during that window get `None` immediately
//! instead of hammering a broken dependency. Construction happens under a
//! dedicated mutex so at most one build runs at a time, while reads of an
//! existing engine only take a shared lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::engine::{Capability, EngineFactory, EngineSettings, ErrorDetail, FailureKind};

/// Minimum delay between two construction attempts after a failure.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Monotonic time source, swappable in tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct EngineState<E> {
    instance: Option<Arc<E>>,
    last_error: Option<ErrorDetail>,
    last_attempt: Option<Instant>,
}

/// Outcome of the lock-light check that precedes construction.
enum Lookup<E> {
    Ready(Arc<E>),
    CoolingDown,
    Stale,
}

/// Owns the process-wide recognition engine.
pub struct EngineManager<F: EngineFactory, C: Clock = SystemClock> {
    factory: F,
    settings: EngineSettings,
    clock: C,
    retry_interval: Duration,
    decoder: Capability,
    recognition: Capability,
    state: RwLock<EngineState<F::Engine>>,
    init_lock: Mutex<()>,
}

impl<F: EngineFactory> EngineManager<F, SystemClock> {
    pub fn new(factory: F, settings: EngineSettings, decoder: Capability) -> Self {
        Self::with_clock(factory, settings, decoder, SystemClock)
    }
}

impl<F: EngineFactory, C: Clock> EngineManager<F, C> {
    /// Build a manager, probing the recognition backend once.
    pub fn with_clock(factory: F, settings: EngineSettings, decoder: Capability, clock: C) -> Self {
        let recognition = factory.probe(&settings);
        if let Capability::Unavailable(reason) = &decoder {
            tracing::warn!(reason = %reason, "image decoder unavailable");
        }
        if let Capability::Unavailable(reason) = &recognition {
            tracing::warn!(reason = %reason, "recognition backend unavailable");
        }

        Self {
            factory,
            settings,
            clock,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            decoder,
            recognition,
            state: RwLock::new(EngineState {
                instance: None,
                last_error: None,
                last_attempt: None,
            }),
            init_lock: Mutex::new(()),
        }
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn decoder(&self) -> &Capability {
        &self.decoder
    }

    /// Return the engine, building it if needed and allowed.
    ///
    /// Never blocks on a broken dependency for longer than one construction
    /// attempt, and never surfaces construction errors: they are recorded
    /// and reported through [`last_error`](Self::last_error).
    pub fn acquire(&self) -> Option<Arc<F::Engine>> {
        match self.lookup() {
            Lookup::Ready(engine) => return Some(engine),
            Lookup::CoolingDown => return None,
            Lookup::Stale => {}
        }

        let _guard = self.init_lock.lock();

        // Another caller may have finished (or failed) while we waited.
        match self.lookup() {
            Lookup::Ready(engine) => return Some(engine),
            Lookup::CoolingDown => return None,
            Lookup::Stale => {}
        }

        if let Capability::Unavailable(reason) = &self.recognition {
            tracing::error!(reason = %reason, "recognition backend missing");
            self.record_failure(ErrorDetail::new(FailureKind::DependencyMissing, reason.clone()));
            return None;
        }

        tracing::info!(
            model = %self.settings.model_name,
            ctx_id = self.settings.ctx_id,
            det_size = self.settings.det_size,
            "initializing face engine"
        );
        match self.factory.construct(&self.settings) {
            Ok(engine) => {
                let engine = Arc::new(engine);
                let mut state = self.state.write();
                state.instance = Some(Arc::clone(&engine));
                state.last_error = None;
                state.last_attempt = Some(self.clock.now());
                tracing::info!("face engine initialized");
                Some(engine)
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot initialize face engine");
                self.record_failure(ErrorDetail::new(
                    FailureKind::EngineConstructionFailed,
                    e.to_string(),
                ));
                None
            }
        }
    }

    /// Force construction ahead of real traffic; `true` if an engine is usable.
    pub fn warmup(&self) -> bool {
        self.decoder.is_available() && self.acquire().is_some()
    }

    /// Most relevant engine-health error for diagnostics.
    ///
    /// Recorded construction or inference failures win over a missing image
    /// decoder, which wins over a missing recognition backend.
    pub fn last_error(&self) -> Option<String> {
        if let Some(detail) = &self.state.read().last_error {
            return Some(detail.to_string());
        }
        self.decoder
            .reason()
            .or(self.recognition.reason())
            .map(|reason| format!("{}: {reason}", FailureKind::DependencyMissing.as_str()))
    }

    /// Drop `engine` after an inference fault on it.
    ///
    /// The failure starts a new cooldown; the next `acquire` after it expires
    /// rebuilds the engine. Faults reported against an engine that has
    /// already been replaced are ignored.
    pub fn mark_unhealthy(&self, engine: &Arc<F::Engine>, detail: ErrorDetail) {
        let mut state = self.state.write();
        match &state.instance {
            Some(current) if Arc::ptr_eq(current, engine) => {}
            _ => {
                tracing::debug!(error = %detail, "ignoring fault from a replaced face engine");
                return;
            }
        }
        tracing::error!(error = %detail, "face engine marked unhealthy");
        state.instance = None;
        state.last_error = Some(detail);
        state.last_attempt = Some(self.clock.now());
    }

    fn lookup(&self) -> Lookup<F::Engine> {
        let state = self.state.read();
        if let Some(engine) = &state.instance {
            return Lookup::Ready(Arc::clone(engine));
        }
        match (&state.last_error, state.last_attempt) {
            (Some(_), Some(at))
                if self.clock.now().saturating_duration_since(at) < self.retry_interval =>
            {
                Lookup::CoolingDown
            }
            _ => Lookup::Stale,
        }
    }

    fn record_failure(&self, detail: ErrorDetail) {
        let mut state = self.state.write();
        state.instance = None;
        state.last_error = Some(detail);
        state.last_attempt = Some(self.clock.now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeClock, ScriptedFactory};
    use std::sync::Barrier;

    fn manager(
        factory: ScriptedFactory,
        clock: FakeClock,
    ) -> EngineManager<ScriptedFactory, FakeClock> {
        EngineManager::with_clock(factory, EngineSettings::default(), Capability::Available, clock)
    }

    #[test]
    fn test_acquire_builds_once_and_reuses() {
        let factory = ScriptedFactory::default();
        let mgr = manager(factory.clone(), FakeClock::new());

        let first = mgr.acquire().unwrap();
        let second = mgr.acquire().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.constructions(), 1);
        assert!(mgr.last_error().is_none());
    }

    #[test]
    fn test_failure_is_cached_until_cooldown_expires() {
        let factory = ScriptedFactory::default().fail_first(1);
        let clock = FakeClock::new();
        let mgr = manager(factory.clone(), clock.clone());

        assert!(mgr.acquire().is_none());
        assert!(mgr.acquire().is_none());
        assert_eq!(factory.constructions(), 1, "second call must not retry inside the cooldown");
        let err = mgr.last_error().unwrap();
        assert!(err.starts_with("engine_construction_failed"), "{err}");

        clock.advance(Duration::from_secs(14));
        assert!(mgr.acquire().is_none());
        assert_eq!(factory.constructions(), 1);

        clock.advance(Duration::from_secs(2));
        assert!(mgr.acquire().is_some());
        assert_eq!(factory.constructions(), 2);
        assert!(mgr.last_error().is_none(), "success clears the error");
    }

    #[test]
    fn test_custom_retry_interval() {
        let factory = ScriptedFactory::default().fail_first(1);
        let clock = FakeClock::new();
        let mgr = manager(factory.clone(), clock.clone()).retry_interval(Duration::from_secs(1));

        assert!(mgr.acquire().is_none());
        clock.advance(Duration::from_millis(1001));
        assert!(mgr.acquire().is_some());
    }

    #[test]
    fn test_concurrent_first_acquire_constructs_once() {
        let factory = ScriptedFactory::default().construct_delay(Duration::from_millis(50));
        let mgr = Arc::new(manager(factory.clone(), FakeClock::new()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    mgr.acquire().is_some()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(factory.constructions(), 1);
    }

    #[test]
    fn test_concurrent_failure_constructs_once() {
        let factory = ScriptedFactory::default()
            .fail_first(usize::MAX)
            .construct_delay(Duration::from_millis(20));
        let mgr = Arc::new(manager(factory.clone(), FakeClock::new()));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                std::thread::spawn(move || mgr.acquire().is_none())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(factory.constructions(), 1, "losers of the race see the cached failure");
    }

    #[test]
    fn test_missing_recognition_backend() {
        let factory = ScriptedFactory::default().unavailable("onnx runtime not found");
        let clock = FakeClock::new();
        let mgr = manager(factory.clone(), clock.clone());

        assert_eq!(
            mgr.last_error().as_deref(),
            Some("dependency_missing: onnx runtime not found")
        );
        assert!(!mgr.warmup());
        assert_eq!(factory.constructions(), 0);
        assert!(mgr.last_error().unwrap().contains("onnx runtime not found"));
    }

    #[test]
    fn test_warmup_requires_decoder() {
        let factory = ScriptedFactory::default();
        let mgr = EngineManager::with_clock(
            factory.clone(),
            EngineSettings::default(),
            Capability::Unavailable("jpeg decoding disabled".into()),
            FakeClock::new(),
        );

        assert!(!mgr.warmup());
        assert_eq!(factory.constructions(), 0);
        assert_eq!(
            mgr.last_error().as_deref(),
            Some("dependency_missing: jpeg decoding disabled")
        );
    }

    #[test]
    fn test_error_precedence() {
        let mgr = EngineManager::with_clock(
            ScriptedFactory::default().unavailable("no backend"),
            EngineSettings::default(),
            Capability::Unavailable("no decoder".into()),
            FakeClock::new(),
        );
        assert_eq!(mgr.last_error().as_deref(), Some("dependency_missing: no decoder"));

        let mgr = EngineManager::with_clock(
            ScriptedFactory::default(),
            EngineSettings::default(),
            Capability::Unavailable("no decoder".into()),
            FakeClock::new(),
        );
        let engine = mgr.acquire().unwrap();
        mgr.mark_unhealthy(&engine, ErrorDetail::new(FailureKind::InferenceFailed, "boom"));
        assert_eq!(mgr.last_error().as_deref(), Some("inference_error: boom"));
    }

    #[test]
    fn test_mark_unhealthy_forces_rebuild_after_cooldown() {
        let factory = ScriptedFactory::default();
        let clock = FakeClock::new();
        let mgr = manager(factory.clone(), clock.clone());

        let engine = mgr.acquire().unwrap();
        mgr.mark_unhealthy(&engine, ErrorDetail::new(FailureKind::InferenceFailed, "session lost"));
        assert!(mgr.acquire().is_none());
        assert_eq!(mgr.last_error().as_deref(), Some("inference_error: session lost"));

        clock.advance(DEFAULT_RETRY_INTERVAL);
        assert!(mgr.acquire().is_some());
        assert_eq!(factory.constructions(), 2);
    }

    #[test]
    fn test_late_fault_from_replaced_engine_is_ignored() {
        let factory = ScriptedFactory::default();
        let clock = FakeClock::new();
        let mgr = manager(factory.clone(), clock.clone());

        let old = mgr.acquire().unwrap();
        mgr.mark_unhealthy(&old, ErrorDetail::new(FailureKind::InferenceFailed, "first fault"));
        clock.advance(DEFAULT_RETRY_INTERVAL);
        let current = mgr.acquire().unwrap();
        assert!(!Arc::ptr_eq(&old, &current));

        // A request that still held the old engine reports its fault late.
        mgr.mark_unhealthy(&old, ErrorDetail::new(FailureKind::InferenceFailed, "late fault"));
        let after = mgr.acquire().unwrap();
        assert!(Arc::ptr_eq(&after, &current));
        assert!(mgr.last_error().is_none());
        assert_eq!(factory.constructions(), 2);
    }
}
