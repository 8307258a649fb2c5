use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures_core::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::abandoned::{self, AbandonedConfig};
use crate::config::PoolConfig;
use crate::deque::IdleDeque;
use crate::entry::{EntryState, EvictionTestEnd, PooledEntry};
use crate::error::{FactoryPhase, PoolError};
use crate::evictor::{self, EvictorRegistration, MaintenanceJob};
use crate::factory::{DestroyReason, PoolableFactory, TrackedUse};
use crate::policy::{EvictionConfig, EvictionPolicy, EvictionPolicyChoice};
use crate::stats::{PoolStats, PoolStatus};

/// Which counter a destruction belongs to.
#[derive(Clone, Copy, Debug)]
pub(crate) enum DestroyCause {
    Regular,
    Evictor,
    Validation,
}

struct LiveSet<T> {
    all: HashMap<u64, Arc<PooledEntry<T>>>,
    closed: bool,
}

struct PoolShared<M: PoolableFactory> {
    factory: M,
    config: PoolConfig,
    abandoned: Option<AbandonedConfig>,
    policy: Arc<dyn EvictionPolicy>,
    runtime: Handle,
    created_at: &'static Location<'static>,
    idle: IdleDeque<M::Object>,
    live: Mutex<LiveSet<M::Object>>,
    // Registered instances plus in-flight creations; the creation gate.
    create_count: AtomicIsize,
    entry_seq: AtomicU64,
    stats: PoolStats,
    evictor: Mutex<Option<EvictorRegistration>>,
}

/// A generic asynchronous object pool.
///
/// Instances are produced by a [`PoolableFactory`] and handed out as
/// [`Pooled`] guards. Cloning the pool is cheap and every clone operates on
/// the same state.
pub struct Pool<M: PoolableFactory> {
    shared: Arc<PoolShared<M>>,
}

impl<M: PoolableFactory> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Pool {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: PoolableFactory> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.config.common.name)
            .field("num_idle", &self.num_idle())
            .finish()
    }
}

/// Configures and constructs a [`Pool`].
pub struct PoolBuilder<M: PoolableFactory> {
    config: PoolConfig,
    abandoned: Option<AbandonedConfig>,
    policy: EvictionPolicyChoice,
    _marker: PhantomData<M>,
}

impl<M: PoolableFactory> Default for PoolBuilder<M> {
    fn default() -> Self {
        PoolBuilder {
            config: PoolConfig::default(),
            abandoned: None,
            policy: EvictionPolicyChoice::Default,
            _marker: PhantomData,
        }
    }
}

impl<M: PoolableFactory> PoolBuilder<M> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Starts from an existing configuration.
    pub fn from_config(config: PoolConfig) -> Self {
        PoolBuilder {
            config,
            ..Default::default()
        }
    }

    /// Cap on instances managed at once. `None` is unlimited. Defaults to 8.
    pub fn max_total(mut self, max_total: impl Into<Option<usize>>) -> Self {
        self.config.max_total = max_total.into();
        self
    }

    /// Cap on idle instances retained on return. `None` is unlimited.
    /// Defaults to 8.
    pub fn max_idle(mut self, max_idle: impl Into<Option<usize>>) -> Self {
        self.config.max_idle = max_idle.into();
        self
    }

    /// Idle floor replenished by the maintenance task. Defaults to 0.
    pub fn min_idle(mut self, min_idle: usize) -> Self {
        self.config.min_idle = min_idle;
        self
    }

    /// Idle polarity. Defaults to `true` (most recently returned first).
    pub fn lifo(mut self, lifo: bool) -> Self {
        self.config.common.lifo = lifo;
        self
    }

    /// Retained for configuration compatibility; handoff is always
    /// enrollment-ordered.
    pub fn fairness(mut self, fairness: bool) -> Self {
        self.config.common.fairness = fairness;
        self
    }

    /// Default bound on blocking borrows. `None` waits forever.
    pub fn max_wait(mut self, max_wait: impl Into<Option<Duration>>) -> Self {
        self.config.common.max_wait = max_wait.into();
        self
    }

    /// Whether an exhausted borrow waits or fails fast. Defaults to `true`.
    pub fn block_when_exhausted(mut self, block: bool) -> Self {
        self.config.common.block_when_exhausted = block;
        self
    }

    /// Validate instances right after creation. Defaults to `false`.
    pub fn test_on_create(mut self, test: bool) -> Self {
        self.config.common.test_on_create = test;
        self
    }

    /// Validate instances before handout. Defaults to `false`.
    pub fn test_on_borrow(mut self, test: bool) -> Self {
        self.config.common.test_on_borrow = test;
        self
    }

    /// Validate instances on return. Defaults to `false`.
    pub fn test_on_return(mut self, test: bool) -> Self {
        self.config.common.test_on_return = test;
        self
    }

    /// Validate idle instances during maintenance. Defaults to `false`.
    pub fn test_while_idle(mut self, test: bool) -> Self {
        self.config.common.test_while_idle = test;
        self
    }

    /// Cadence of the background maintenance task. `None` disables it.
    pub fn time_between_eviction_runs(mut self, period: impl Into<Option<Duration>>) -> Self {
        self.config.common.time_between_eviction_runs = period.into();
        self
    }

    /// Idle instances examined per maintenance run. Negative `-n` examines
    /// `ceil(idle / n)`; zero disables idle testing. Defaults to 3.
    pub fn num_tests_per_eviction_run(mut self, tests: i32) -> Self {
        self.config.common.num_tests_per_eviction_run = tests;
        self
    }

    /// Hard idle eviction threshold. Defaults to 30 minutes.
    pub fn min_evictable_idle(mut self, idle: impl Into<Option<Duration>>) -> Self {
        self.config.common.min_evictable_idle = idle.into();
        self
    }

    /// Soft idle eviction threshold, honored above the `min_idle` floor.
    /// Defaults to `None`.
    pub fn soft_min_evictable_idle(mut self, idle: impl Into<Option<Duration>>) -> Self {
        self.config.common.soft_min_evictable_idle = idle.into();
        self
    }

    /// Uses the supplied eviction policy.
    pub fn eviction_policy(mut self, policy: Arc<dyn EvictionPolicy>) -> Self {
        self.policy = EvictionPolicyChoice::Custom(policy);
        self
    }

    /// Selects a policy from the process-wide registry at build time.
    pub fn eviction_policy_name(mut self, name: impl Into<String>) -> Self {
        self.policy = EvictionPolicyChoice::Named(name.into());
        self
    }

    /// Enables the abandoned-object tracker.
    pub fn abandoned_config(mut self, config: AbandonedConfig) -> Self {
        self.abandoned = Some(config);
        self
    }

    /// Names the pool for status snapshots and log events.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.common.name = Some(name.into());
        self
    }

    /// Builds the pool.
    ///
    /// Must be called within a Tokio runtime: the pool records the runtime
    /// handle for guard-drop returns and maintenance dispatch.
    #[track_caller]
    pub fn build(self, factory: M) -> Pool<M> {
        let created_at = Location::caller();
        let policy = self.policy.resolve();
        let interval = self.config.common.time_between_eviction_runs;
        let shared = Arc::new(PoolShared {
            factory,
            config: self.config,
            abandoned: self.abandoned,
            policy,
            runtime: Handle::current(),
            created_at,
            idle: IdleDeque::new(),
            live: Mutex::new(LiveSet {
                all: HashMap::new(),
                closed: false,
            }),
            create_count: AtomicIsize::new(0),
            entry_seq: AtomicU64::new(1),
            stats: PoolStats::new(),
            evictor: Mutex::new(None),
        });
        let pool = Pool { shared };
        pool.set_eviction_interval(interval);
        debug!(
            name = pool.shared.config.common.name.as_deref().unwrap_or(""),
            at = %created_at,
            "pool created"
        );
        pool
    }
}

impl<M: PoolableFactory> Pool<M> {
    /// Returns a builder to configure a new pool.
    pub fn builder() -> PoolBuilder<M> {
        PoolBuilder::new()
    }

    /// Builds a pool with the default configuration.
    #[track_caller]
    pub fn new(factory: M) -> Pool<M> {
        PoolBuilder::new().build(factory)
    }

    /// Borrows an instance, waiting up to the configured `max_wait`.
    pub async fn borrow(&self) -> Result<Pooled<M>, PoolError<M::Error>> {
        self.borrow_timeout(self.shared.config.common.max_wait).await
    }

    /// Borrows an instance, waiting up to `max_wait` (forever when `None`)
    /// if the pool is exhausted and blocking is enabled.
    pub async fn borrow_timeout(
        &self,
        max_wait: Option<Duration>,
    ) -> Result<Pooled<M>, PoolError<M::Error>> {
        self.ensure_open()?;
        let start = Instant::now();

        if let Some(config) = &self.shared.abandoned {
            if config.remove_on_borrow && self.near_exhaustion() {
                self.remove_abandoned(config).await;
            }
        }

        let deadline = max_wait.map(|wait| start + wait);
        loop {
            self.ensure_open()?;

            let mut freshly_created = false;
            let polled = match self.shared.idle.try_poll_first() {
                Some(entry) => Some(entry),
                None => match self.try_create().await? {
                    Some(entry) => {
                        freshly_created = true;
                        Some(entry)
                    }
                    None => None,
                },
            };

            let entry = match polled {
                Some(entry) => entry,
                None if !self.shared.config.common.block_when_exhausted => {
                    return Err(PoolError::Exhausted)
                }
                None => {
                    let remaining =
                        deadline.map(|at| at.saturating_duration_since(Instant::now()));
                    if remaining.is_some_and(|left| left.is_zero()) {
                        return Err(PoolError::Exhausted);
                    }
                    match self.shared.idle.poll_first(remaining).await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => return Err(PoolError::Exhausted),
                        Err(_interrupted) => {
                            return Err(if self.is_closed() {
                                PoolError::Closed
                            } else {
                                PoolError::Interrupted
                            });
                        }
                    }
                }
            };

            let idled = entry.idle_duration();
            let borrowed_by = self
                .shared
                .abandoned
                .as_ref()
                .filter(|config| config.log_abandoned)
                .map(|config| config.capture_call_site());
            let mut obj = match entry.allocate(borrowed_by) {
                Some(obj) => obj,
                // Mid-eviction-test or already claimed; try another entry.
                None => continue,
            };

            if let Err(error) = self.shared.factory.activate(&mut obj).await {
                self.destroy_entry(&entry, Some(obj), DestroyReason::Normal, DestroyCause::Regular)
                    .await;
                if freshly_created {
                    return Err(PoolError::Factory {
                        phase: FactoryPhase::Activate,
                        source: error,
                    });
                }
                self.shared.stats.swallow("activate", &error);
                continue;
            }

            let common = &self.shared.config.common;
            if common.test_on_borrow || (freshly_created && common.test_on_create) {
                entry.begin_validation();
                let valid = self.shared.factory.validate(&mut obj).await;
                entry.end_validation();
                if !valid {
                    self.destroy_entry(
                        &entry,
                        Some(obj),
                        DestroyReason::Normal,
                        DestroyCause::Validation,
                    )
                    .await;
                    continue;
                }
            }

            self.shared.stats.record_borrow(start.elapsed(), idled);
            trace!(entry = entry.id(), "object borrowed");
            let (track_usage, log_abandoned, full_trace) = self
                .shared
                .abandoned
                .as_ref()
                .map(|config| {
                    (
                        config.use_usage_tracking,
                        config.log_abandoned,
                        config.require_full_stack_trace,
                    )
                })
                .unwrap_or((false, false, false));
            return Ok(Pooled {
                obj: Some(obj),
                entry: Some(entry),
                pool: Arc::downgrade(&self.shared),
                track_usage,
                log_abandoned,
                full_trace,
            });
        }
    }

    /// Returns a borrowed instance to the pool.
    ///
    /// Dropping the guard does the same thing in the background; the explicit
    /// form completes the lifecycle before resolving and surfaces errors.
    pub async fn return_object(&self, guard: Pooled<M>) -> Result<(), PoolError<M::Error>> {
        let (entry, obj) = self.claim_guard(guard)?;
        self.return_inner(entry, obj).await
    }

    /// Destroys a borrowed instance instead of returning it.
    pub async fn invalidate_object(&self, guard: Pooled<M>) -> Result<(), PoolError<M::Error>> {
        self.invalidate_object_with_reason(guard, DestroyReason::Normal)
            .await
    }

    /// Destroys a borrowed instance, passing `reason` to the factory.
    pub async fn invalidate_object_with_reason(
        &self,
        guard: Pooled<M>,
        reason: DestroyReason,
    ) -> Result<(), PoolError<M::Error>> {
        let (entry, obj) = self.claim_guard(guard)?;
        let registered = {
            self.shared
                .live
                .lock()
                .unwrap()
                .all
                .contains_key(&entry.id())
        };
        if !registered {
            if self.shared.abandoned.is_some() {
                // Reclaimed while borrowed; finish the teardown quietly.
                if let Err(error) = self
                    .shared
                    .factory
                    .destroy(obj, DestroyReason::Abandoned)
                    .await
                {
                    self.shared.stats.swallow("destroy", &error);
                }
                return Ok(());
            }
            return Err(PoolError::Foreign);
        }
        self.destroy_entry(&entry, Some(obj), reason, DestroyCause::Regular)
            .await;
        self.ensure_idle(1, false).await
    }

    /// Creates an instance, passivates it, and parks it idle. Does nothing
    /// when the pool is at capacity.
    pub async fn add_object(&self) -> Result<(), PoolError<M::Error>> {
        self.ensure_open()?;
        if !self.reserve_capacity() {
            return Ok(());
        }
        let mut obj = match self.shared.factory.make().await {
            Ok(obj) => obj,
            Err(error) => {
                self.release_capacity();
                return Err(PoolError::Factory {
                    phase: FactoryPhase::Make,
                    source: error,
                });
            }
        };
        self.shared.stats.created.fetch_add(1, Ordering::Relaxed);

        if let Err(error) = self.shared.factory.passivate(&mut obj).await {
            self.release_capacity();
            self.shared.stats.destroyed.fetch_add(1, Ordering::Relaxed);
            if let Err(destroy_error) =
                self.shared.factory.destroy(obj, DestroyReason::Normal).await
            {
                self.shared.stats.swallow("destroy", &destroy_error);
            }
            return Err(PoolError::Factory {
                phase: FactoryPhase::Passivate,
                source: error,
            });
        }

        match self.register(obj) {
            Ok(entry) => {
                if self.shared.config.common.lifo {
                    self.shared.idle.offer_first(entry);
                } else {
                    self.shared.idle.offer_last(entry);
                }
                if self.is_closed() {
                    // Closed while the add was in flight; sweep what we added.
                    self.clear().await;
                }
                Ok(())
            }
            Err(obj) => {
                self.release_capacity();
                self.shared.stats.destroyed.fetch_add(1, Ordering::Relaxed);
                if let Err(error) = self.shared.factory.destroy(obj, DestroyReason::Normal).await {
                    self.shared.stats.swallow("destroy", &error);
                }
                Err(PoolError::Closed)
            }
        }
    }

    /// Destroys every idle instance. Borrowed instances are unaffected and
    /// remain owned by the pool.
    pub async fn clear(&self) {
        while let Some(entry) = self.shared.idle.try_poll_first() {
            self.destroy_entry(&entry, None, DestroyReason::Normal, DestroyCause::Regular)
                .await;
        }
    }

    /// Closes the pool: stops maintenance, destroys idle instances, and
    /// wakes every suspended borrower. Idempotent. Instances returned after
    /// close are destroyed silently.
    pub async fn close(&self) {
        {
            let mut live = self.shared.live.lock().unwrap();
            if live.closed {
                return;
            }
            live.closed = true;
        }
        debug!(
            name = self.shared.config.common.name.as_deref().unwrap_or(""),
            "closing pool"
        );
        *self.shared.evictor.lock().unwrap() = None;
        self.clear().await;
        self.shared.idle.interrupt_takers();
    }

    /// One maintenance pass: walk idle entries oldest-first up to the
    /// per-run budget, destroy the ones the eviction policy rejects, and
    /// optionally health-check the rest.
    pub async fn evict(&self) -> Result<(), PoolError<M::Error>> {
        self.ensure_open()?;
        let idle_count = self.shared.idle.len();
        let tests = self.shared.config.common.num_tests_per_eviction_run;
        if idle_count > 0 && tests != 0 {
            let mut candidates = self.shared.idle.snapshot();
            if self.shared.config.common.lifo {
                // Head holds the most recently returned; walk old to new.
                candidates.reverse();
            }
            let budget = eviction_test_budget(tests, idle_count);
            let eviction_config = EvictionConfig {
                idle_evict_time: self.shared.config.common.min_evictable_idle,
                idle_soft_evict_time: self.shared.config.common.soft_min_evictable_idle,
                min_idle: self.shared.config.min_idle,
            };

            let mut tested = 0;
            for entry in candidates {
                if tested == budget {
                    break;
                }
                let Some(mut obj) = entry.start_eviction_test() else {
                    // Borrowed or destroyed since the snapshot; not counted.
                    continue;
                };
                tested += 1;

                let candidate = entry.eviction_candidate();
                if self
                    .shared
                    .policy
                    .evict(&eviction_config, &candidate, self.shared.idle.len())
                {
                    trace!(entry = entry.id(), "evicting idle object");
                    self.destroy_entry(
                        &entry,
                        Some(obj),
                        DestroyReason::Normal,
                        DestroyCause::Evictor,
                    )
                    .await;
                    continue;
                }

                if self.shared.config.common.test_while_idle {
                    let healthy = match self.shared.factory.activate(&mut obj).await {
                        Ok(()) => {
                            if self.shared.factory.validate(&mut obj).await {
                                match self.shared.factory.passivate(&mut obj).await {
                                    Ok(()) => true,
                                    Err(error) => {
                                        self.shared.stats.swallow("passivate", &error);
                                        false
                                    }
                                }
                            } else {
                                false
                            }
                        }
                        Err(error) => {
                            self.shared.stats.swallow("activate", &error);
                            false
                        }
                    };
                    if !healthy {
                        self.destroy_entry(
                            &entry,
                            Some(obj),
                            DestroyReason::Normal,
                            DestroyCause::Evictor,
                        )
                        .await;
                        continue;
                    }
                }

                match entry.end_eviction_test(obj) {
                    EvictionTestEnd::InPlace => {}
                    EvictionTestEnd::ReturnToHead => self.shared.idle.offer_first(entry),
                    EvictionTestEnd::Dead(obj) => {
                        if let Err(error) =
                            self.shared.factory.destroy(obj, DestroyReason::Normal).await
                        {
                            self.shared.stats.swallow("destroy", &error);
                        }
                    }
                }
            }
        }

        if let Some(config) = &self.shared.abandoned {
            if config.remove_on_maintenance {
                self.remove_abandoned(config).await;
            }
        }
        Ok(())
    }

    /// Tops the idle set up to the configured `min_idle`, capacity
    /// permitting.
    pub async fn ensure_min_idle(&self) -> Result<(), PoolError<M::Error>> {
        self.ensure_idle(self.shared.config.min_idle, true).await
    }

    /// Instances currently borrowed.
    pub fn num_active(&self) -> usize {
        let total = self.shared.live.lock().unwrap().all.len();
        total.saturating_sub(self.shared.idle.len())
    }

    /// Instances currently idle.
    pub fn num_idle(&self) -> usize {
        self.shared.idle.len()
    }

    /// Borrowers currently suspended.
    pub fn num_waiters(&self) -> usize {
        self.shared.idle.taker_count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.live.lock().unwrap().closed
    }

    /// A point-in-time snapshot of population and counters.
    pub fn status(&self) -> PoolStatus {
        let stats = self.shared.stats.snapshot();
        PoolStatus {
            name: self.shared.config.common.name.clone(),
            created_at: self.shared.created_at.to_string(),
            num_active: self.num_active(),
            num_idle: self.num_idle(),
            num_waiters: self.num_waiters(),
            created: stats.created,
            destroyed: stats.destroyed,
            destroyed_by_evictor: stats.destroyed_by_evictor,
            destroyed_by_validation: stats.destroyed_by_validation,
            borrowed: stats.borrowed,
            returned: stats.returned,
            max_borrow_wait: stats.max_borrow_wait,
            mean_active_time: stats.mean_active_time,
            mean_idle_time: stats.mean_idle_time,
            mean_borrow_wait: stats.mean_borrow_wait,
            swallowed_errors: self.shared.stats.swallowed_summaries(),
        }
    }

    /// Replaces the maintenance cadence, cancelling and re-registering the
    /// pool's task with the shared scheduler.
    pub fn set_eviction_interval(&self, interval: Option<Duration>) {
        let mut registration = self.shared.evictor.lock().unwrap();
        *registration = None;
        if let Some(period) = interval.filter(|period| !period.is_zero()) {
            if self.is_closed() {
                return;
            }
            *registration = Some(evictor::register(
                period,
                self.shared.runtime.clone(),
                self.maintenance_job(),
            ));
        }
    }

    fn maintenance_job(&self) -> MaintenanceJob {
        let weak = Arc::downgrade(&self.shared);
        Arc::new(move || {
            let weak = Weak::clone(&weak);
            let job: BoxFuture<'static, ()> = Box::pin(async move {
                let Some(shared) = weak.upgrade() else { return };
                let pool = Pool { shared };
                if pool.is_closed() {
                    return;
                }
                if let Err(error) = pool.evict().await {
                    pool.shared.stats.swallow("evict", &error);
                }
                if let Err(error) = pool.ensure_min_idle().await {
                    pool.shared.stats.swallow("ensure-min-idle", &error);
                }
            });
            job
        })
    }

    fn ensure_open(&self) -> Result<(), PoolError<M::Error>> {
        if self.is_closed() {
            Err(PoolError::Closed)
        } else {
            Ok(())
        }
    }

    fn near_exhaustion(&self) -> bool {
        if self.shared.idle.len() >= 2 {
            return false;
        }
        match self.shared.config.max_total {
            Some(max_total) => self.num_active() as isize > max_total as isize - 3,
            None => false,
        }
    }

    fn reserve_capacity(&self) -> bool {
        let cap = self.shared.config.max_total;
        self.shared
            .create_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| match cap {
                Some(limit) if current >= limit as isize => None,
                _ => Some(current + 1),
            })
            .is_ok()
    }

    fn release_capacity(&self) {
        self.shared.create_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn register(&self, obj: M::Object) -> Result<Arc<PooledEntry<M::Object>>, M::Object> {
        let id = self.shared.entry_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(PooledEntry::new(id, obj));
        let mut live = self.shared.live.lock().unwrap();
        if live.closed {
            drop(live);
            let obj = entry.invalidate().expect("fresh entry holds its object");
            return Err(obj);
        }
        live.all.insert(id, Arc::clone(&entry));
        Ok(entry)
    }

    /// Creates and registers one instance, or returns `None` when the
    /// creation gate is at capacity.
    async fn try_create(
        &self,
    ) -> Result<Option<Arc<PooledEntry<M::Object>>>, PoolError<M::Error>> {
        if !self.reserve_capacity() {
            return Ok(None);
        }
        let obj = match self.shared.factory.make().await {
            Ok(obj) => obj,
            Err(error) => {
                self.release_capacity();
                return Err(PoolError::Factory {
                    phase: FactoryPhase::Make,
                    source: error,
                });
            }
        };
        self.shared.stats.created.fetch_add(1, Ordering::Relaxed);
        match self.register(obj) {
            Ok(entry) => {
                trace!(entry = entry.id(), "object created");
                Ok(Some(entry))
            }
            Err(obj) => {
                self.release_capacity();
                self.shared.stats.destroyed.fetch_add(1, Ordering::Relaxed);
                if let Err(error) = self.shared.factory.destroy(obj, DestroyReason::Normal).await {
                    self.shared.stats.swallow("destroy", &error);
                }
                Err(PoolError::Closed)
            }
        }
    }

    /// Creates up to `target` idle instances. With `always` false this is a
    /// no-op unless borrowers are suspended, which keeps replacement
    /// creations demand-driven.
    async fn ensure_idle(&self, target: usize, always: bool) -> Result<(), PoolError<M::Error>> {
        if !always && !self.shared.idle.has_takers() {
            return Ok(());
        }
        let mut created = 0;
        while self.shared.idle.len() < target && created < target {
            if self.is_closed() {
                break;
            }
            let Some(entry) = self.try_create().await? else {
                break;
            };
            created += 1;
            if self.shared.config.common.lifo {
                self.shared.idle.offer_first(entry);
            } else {
                self.shared.idle.offer_last(entry);
            }
        }
        if created > 0 && self.is_closed() {
            self.clear().await;
        }
        Ok(())
    }

    fn claim_guard(
        &self,
        mut guard: Pooled<M>,
    ) -> Result<(Arc<PooledEntry<M::Object>>, M::Object), PoolError<M::Error>> {
        let owned_here = guard
            .pool
            .upgrade()
            .map_or(false, |shared| Arc::ptr_eq(&shared, &self.shared));
        if !owned_here {
            // The guard drops here and finds its way home on its own.
            return Err(PoolError::Foreign);
        }
        let entry = guard.entry.take().expect("guard already consumed");
        let obj = guard.obj.take().expect("guard already consumed");
        Ok((entry, obj))
    }

    async fn return_inner(
        &self,
        entry: Arc<PooledEntry<M::Object>>,
        mut obj: M::Object,
    ) -> Result<(), PoolError<M::Error>> {
        let registered = {
            self.shared
                .live
                .lock()
                .unwrap()
                .all
                .contains_key(&entry.id())
        };
        if !registered {
            // Reclaimed by the abandonment tracker (or cleared) while it was
            // out. The registry lookup guarantees a newer entry is never
            // touched here.
            let reason = if entry.state() == EntryState::Abandoned {
                DestroyReason::Abandoned
            } else {
                DestroyReason::Normal
            };
            if let Err(error) = self.shared.factory.destroy(obj, reason).await {
                self.shared.stats.swallow("destroy", &error);
            }
            return Ok(());
        }

        if !entry.mark_returning() {
            return Err(PoolError::DoubleReturn);
        }

        self.shared.stats.record_return(entry.active_duration());

        if self.shared.config.common.test_on_return
            && !self.shared.factory.validate(&mut obj).await
        {
            self.destroy_entry(&entry, Some(obj), DestroyReason::Normal, DestroyCause::Regular)
                .await;
            return self.ensure_idle(1, false).await;
        }

        if let Err(error) = self.shared.factory.passivate(&mut obj).await {
            self.shared.stats.swallow("passivate", &error);
            self.destroy_entry(&entry, Some(obj), DestroyReason::Normal, DestroyCause::Regular)
                .await;
            return self.ensure_idle(1, false).await;
        }

        let closed = self.is_closed();
        let over_capacity = self
            .shared
            .config
            .max_idle
            .map_or(false, |limit| self.shared.idle.len() >= limit);
        if closed || over_capacity {
            self.destroy_entry(&entry, Some(obj), DestroyReason::Normal, DestroyCause::Regular)
                .await;
            if !closed {
                return self.ensure_idle(1, false).await;
            }
            return Ok(());
        }

        entry.deallocate(obj);
        trace!(entry = entry.id(), "object returned to idle set");
        if self.shared.config.common.lifo {
            self.shared.idle.offer_first(entry);
        } else {
            self.shared.idle.offer_last(entry);
        }
        if self.is_closed() {
            // Closed while the return was in flight; sweep what we added.
            self.clear().await;
        }
        Ok(())
    }

    async fn destroy_entry(
        &self,
        entry: &Arc<PooledEntry<M::Object>>,
        owned: Option<M::Object>,
        reason: DestroyReason,
        cause: DestroyCause,
    ) {
        let parked = entry.invalidate();
        let obj = owned.or(parked);
        self.shared.idle.remove(entry);
        let deregistered = {
            self.shared
                .live
                .lock()
                .unwrap()
                .all
                .remove(&entry.id())
                .is_some()
        };
        if deregistered {
            self.release_capacity();
            self.shared.stats.destroyed.fetch_add(1, Ordering::Relaxed);
            match cause {
                DestroyCause::Evictor => {
                    self.shared
                        .stats
                        .destroyed_by_evictor
                        .fetch_add(1, Ordering::Relaxed);
                }
                DestroyCause::Validation => {
                    self.shared
                        .stats
                        .destroyed_by_validation
                        .fetch_add(1, Ordering::Relaxed);
                }
                DestroyCause::Regular => {}
            }
        }
        if let Some(obj) = obj {
            if let Err(error) = self.shared.factory.destroy(obj, reason).await {
                self.shared.stats.swallow("destroy", &error);
            }
        }
        trace!(entry = entry.id(), "entry destroyed");
    }

    async fn remove_abandoned(&self, config: &AbandonedConfig) {
        let now = Instant::now();
        let candidates: Vec<Arc<PooledEntry<M::Object>>> = {
            let live = self.shared.live.lock().unwrap();
            live.all
                .values()
                .filter(|entry| entry.is_abandoned_candidate(now, config.timeout))
                .cloned()
                .collect()
        };
        for entry in candidates {
            // A concurrent return beats the sweep; skip such entries.
            if !entry.mark_abandoned() {
                continue;
            }
            let removed = {
                self.shared
                    .live
                    .lock()
                    .unwrap()
                    .all
                    .remove(&entry.id())
                    .is_some()
            };
            if removed {
                self.release_capacity();
                self.shared.stats.destroyed.fetch_add(1, Ordering::Relaxed);
                if config.log_abandoned {
                    warn!(
                        entry = entry.id(),
                        borrows = entry.borrow_count(),
                        borrowed_by = entry.borrowed_by().as_deref().unwrap_or("<not captured>"),
                        used_by = entry.used_by().as_deref().unwrap_or("<not captured>"),
                        "reclaimed abandoned object"
                    );
                } else {
                    debug!(entry = entry.id(), "reclaimed abandoned object");
                }
            }
        }
    }
}

pub(crate) fn eviction_test_budget(tests: i32, idle_count: usize) -> usize {
    if tests > 0 {
        (tests as usize).min(idle_count)
    } else if tests < 0 {
        let divisor = tests.unsigned_abs() as usize;
        (idle_count + divisor - 1) / divisor
    } else {
        0
    }
}

/// A borrowed instance.
///
/// Dereferences to the factory's object type. Dropping the guard schedules
/// the return on the pool's runtime; [`Pool::return_object`] performs it
/// eagerly.
pub struct Pooled<M: PoolableFactory> {
    obj: Option<M::Object>,
    entry: Option<Arc<PooledEntry<M::Object>>>,
    pool: Weak<PoolShared<M>>,
    track_usage: bool,
    log_abandoned: bool,
    full_trace: bool,
}

impl<M: PoolableFactory> Pooled<M> {
    /// Notifies the abandonment tracker that the instance is in use.
    pub fn touch(&self) {
        if let Some(entry) = &self.entry {
            entry.touch();
        }
    }
}

impl<M: PoolableFactory> Pooled<M>
where
    M::Object: TrackedUse,
{
    /// Folds the instance's own last-used timestamp into the pool's record,
    /// keeping whichever is later.
    pub fn sync_last_used(&self) {
        if let (Some(entry), Some(obj)) = (&self.entry, &self.obj) {
            entry.record_use_at(obj.last_used());
        }
    }
}

impl<M: PoolableFactory> Deref for Pooled<M> {
    type Target = M::Object;

    fn deref(&self) -> &M::Object {
        self.obj.as_ref().expect("object already taken")
    }
}

impl<M: PoolableFactory> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut M::Object {
        if self.track_usage {
            if let Some(entry) = &self.entry {
                if self.log_abandoned {
                    entry.set_used_by(abandoned::capture_call_site(self.full_trace));
                } else {
                    entry.touch();
                }
            }
        }
        self.obj.as_mut().expect("object already taken")
    }
}

impl<M: PoolableFactory> fmt::Debug for Pooled<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("entry", &self.entry.as_ref().map(|entry| entry.id()))
            .finish()
    }
}

impl<M: PoolableFactory> Drop for Pooled<M> {
    fn drop(&mut self) {
        let (Some(entry), Some(obj)) = (self.entry.take(), self.obj.take()) else {
            return;
        };
        if let Some(shared) = self.pool.upgrade() {
            let pool = Pool { shared };
            let runtime = pool.shared.runtime.clone();
            runtime.spawn(async move {
                if let Err(error) = pool.return_inner(entry, obj).await {
                    pool.shared.stats.swallow("return", &error);
                }
            });
        } else {
            trace!("pool dropped before its borrowed object came back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;
    use async_trait::async_trait;
    use std::error::Error as StdError;
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64};

    #[derive(Debug)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("test factory error")
        }
    }

    impl StdError for TestError {}

    #[derive(Default)]
    struct Counters {
        made: AtomicU64,
        destroyed: AtomicU64,
        destroyed_abandoned: AtomicU64,
        activated: AtomicU64,
        passivated: AtomicU64,
        validated: AtomicU64,
        concurrent_makes: AtomicI64,
        max_concurrent_makes: AtomicI64,
    }

    struct TestFactory {
        counters: Arc<Counters>,
        /// Upcoming validations that report failure.
        invalid_remaining: AtomicU64,
        fail_make: AtomicBool,
        make_delay: Duration,
    }

    impl TestFactory {
        fn new() -> (TestFactory, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            (
                TestFactory {
                    counters: Arc::clone(&counters),
                    invalid_remaining: AtomicU64::new(0),
                    fail_make: AtomicBool::new(false),
                    make_delay: Duration::ZERO,
                },
                counters,
            )
        }

        fn failing_validation(self, failures: u64) -> Self {
            self.invalid_remaining.store(failures, Ordering::SeqCst);
            self
        }

        fn with_make_delay(mut self, delay: Duration) -> Self {
            self.make_delay = delay;
            self
        }
    }

    #[async_trait]
    impl PoolableFactory for TestFactory {
        type Object = u64;
        type Error = TestError;

        async fn make(&self) -> Result<u64, TestError> {
            let live = self.counters.concurrent_makes.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters
                .max_concurrent_makes
                .fetch_max(live, Ordering::SeqCst);
            if !self.make_delay.is_zero() {
                tokio::time::sleep(self.make_delay).await;
            }
            self.counters.concurrent_makes.fetch_sub(1, Ordering::SeqCst);
            if self.fail_make.load(Ordering::SeqCst) {
                return Err(TestError);
            }
            Ok(self.counters.made.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn destroy(&self, _obj: u64, reason: DestroyReason) -> Result<(), TestError> {
            self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
            if reason == DestroyReason::Abandoned {
                self.counters.destroyed_abandoned.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn validate(&self, _obj: &mut u64) -> bool {
            self.counters.validated.fetch_add(1, Ordering::SeqCst);
            self.invalid_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_err()
        }

        async fn activate(&self, _obj: &mut u64) -> Result<(), TestError> {
            self.counters.activated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn passivate(&self, _obj: &mut u64) -> Result<(), TestError> {
            self.counters.passivated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        for _ in 0..400 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn borrow_and_return_round_trip() {
        let (factory, counters) = TestFactory::new();
        let pool = Pool::builder().max_total(4).build(factory);

        let guard = pool.borrow().await.unwrap();
        assert_eq!(*guard, 1);
        assert_eq!(pool.num_active(), 1);
        assert_eq!(pool.num_idle(), 0);

        pool.return_object(guard).await.unwrap();
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 1);

        // The idle instance is reused; no second make.
        let guard = pool.borrow().await.unwrap();
        assert_eq!(*guard, 1);
        assert_eq!(counters.made.load(Ordering::SeqCst), 1);

        let status = pool.status();
        assert_eq!(status.borrowed, 2);
        assert_eq!(status.returned, 1);
        assert_eq!(status.created, 1);
    }

    #[tokio::test]
    async fn dropping_the_guard_returns_in_the_background() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder().max_total(2).build(factory);

        let guard = pool.borrow().await.unwrap();
        drop(guard);

        wait_until(|| pool.num_idle() == 1).await;
        assert_eq!(pool.num_active(), 0);
    }

    #[tokio::test]
    async fn exhausted_pool_fails_fast_when_not_blocking() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder()
            .max_total(1)
            .block_when_exhausted(false)
            .build(factory);

        let _held = pool.borrow().await.unwrap();
        assert!(matches!(pool.borrow().await, Err(PoolError::Exhausted)));
    }

    #[tokio::test]
    async fn blocking_borrow_times_out_then_is_served_by_a_return() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder().max_total(2).build(factory);

        let first = pool.borrow().await.unwrap();
        let _second = pool.borrow().await.unwrap();

        let start = Instant::now();
        let timed_out = pool.borrow_timeout(Some(Duration::from_millis(50))).await;
        assert!(matches!(timed_out, Err(PoolError::Exhausted)));
        assert!(start.elapsed() >= Duration::from_millis(45));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.borrow_timeout(Some(Duration::from_secs(5)))
                    .await
                    .map(|guard| *guard)
            })
        };
        tokio::task::yield_now().await;
        wait_until(|| pool.num_waiters() == 1).await;

        let released = *first;
        pool.return_object(first).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), released);
    }

    #[tokio::test]
    async fn failed_validation_destroys_and_retries() {
        let (factory, counters) = TestFactory::new();
        let factory = factory.failing_validation(1);
        let pool = Pool::builder()
            .max_total(3)
            .test_on_borrow(true)
            .build(factory);

        let guard = pool.borrow().await.unwrap();
        assert_eq!(*guard, 2, "first instance fails validation");
        assert_eq!(counters.made.load(Ordering::SeqCst), 2);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.num_active() + pool.num_idle(), 1);

        let status = pool.status();
        assert_eq!(status.destroyed_by_validation, 1);
    }

    #[tokio::test]
    async fn evictor_replenishes_min_idle() {
        let _serial = crate::evictor::test_guard();
        let (factory, counters) = TestFactory::new();
        let pool = Pool::builder()
            .max_total(8)
            .min_idle(2)
            .time_between_eviction_runs(Duration::from_millis(50))
            .build(factory);

        wait_until(|| pool.num_idle() >= 2).await;
        assert_eq!(counters.made.load(Ordering::SeqCst), 2);
        assert_eq!(counters.activated.load(Ordering::SeqCst), 0);

        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn creation_gate_bounds_concurrent_makes() {
        let (factory, counters) = TestFactory::new();
        let factory = factory.with_make_delay(Duration::from_millis(20));
        let pool = Pool::builder().max_total(3).build(factory);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let guard = pool
                    .borrow_timeout(Some(Duration::from_secs(5)))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.return_object(guard).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(counters.max_concurrent_makes.load(Ordering::SeqCst) <= 3);
        assert!(counters.made.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn lifo_hands_out_the_freshest_return() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder().max_total(3).build(factory);

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        let c = pool.borrow().await.unwrap();
        let last_returned = *c;
        pool.return_object(a).await.unwrap();
        pool.return_object(b).await.unwrap();
        pool.return_object(c).await.unwrap();

        assert_eq!(*pool.borrow().await.unwrap(), last_returned);
    }

    #[tokio::test]
    async fn fifo_hands_out_the_oldest_idle() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder().max_total(3).lifo(false).build(factory);

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        let oldest = *a;
        pool.return_object(a).await.unwrap();
        pool.return_object(b).await.unwrap();

        assert_eq!(*pool.borrow().await.unwrap(), oldest);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_new_work() {
        let (factory, _counters) = TestFactory::new();
        let pool: Pool<TestFactory> = Pool::builder().build(factory);

        pool.close().await;
        pool.close().await;

        assert!(matches!(pool.borrow().await, Err(PoolError::Closed)));
        assert!(matches!(pool.add_object().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn returns_after_close_destroy_silently() {
        let (factory, counters) = TestFactory::new();
        let pool = Pool::builder().max_total(2).build(factory);

        let guard = pool.borrow().await.unwrap();
        pool.close().await;

        pool.return_object(guard).await.unwrap();
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_active(), 0);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_interrupts_suspended_borrowers() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder().max_total(1).build(factory);

        let _held = pool.borrow().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.borrow().await.map(|_| ()) })
        };
        wait_until(|| pool.num_waiters() == 1).await;

        pool.close().await;
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn max_idle_overflow_is_destroyed_on_return() {
        let (factory, counters) = TestFactory::new();
        let pool = Pool::builder().max_total(4).max_idle(1).build(factory);

        let a = pool.borrow().await.unwrap();
        let b = pool.borrow().await.unwrap();
        pool.return_object(a).await.unwrap();
        pool.return_object(b).await.unwrap();

        assert_eq!(pool.num_idle(), 1);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn foreign_guard_is_rejected_and_finds_its_way_home() {
        let (factory_a, _counters_a) = TestFactory::new();
        let (factory_b, _counters_b) = TestFactory::new();
        let pool_a = Pool::builder().build(factory_a);
        let pool_b = Pool::builder().build(factory_b);

        let guard = pool_a.borrow().await.unwrap();
        assert!(matches!(
            pool_b.return_object(guard).await,
            Err(PoolError::Foreign)
        ));

        wait_until(|| pool_a.num_idle() == 1).await;
        assert_eq!(pool_b.num_idle(), 0);
    }

    #[tokio::test]
    async fn invalidate_frees_capacity_and_serves_waiters() {
        let (factory, counters) = TestFactory::new();
        let pool = Pool::builder().max_total(1).build(factory);

        let guard = pool.borrow().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.borrow_timeout(Some(Duration::from_secs(5)))
                    .await
                    .map(|guard| *guard)
            })
        };
        wait_until(|| pool.num_waiters() == 1).await;

        pool.invalidate_object(guard).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 2);
        assert_eq!(counters.made.load(Ordering::SeqCst), 2);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_objects_are_reclaimed_by_maintenance() {
        let _serial = crate::evictor::test_guard();
        let (factory, counters) = TestFactory::new();
        let pool = Pool::builder()
            .max_total(1)
            .time_between_eviction_runs(Duration::from_millis(30))
            .abandoned_config(AbandonedConfig {
                remove_on_maintenance: true,
                timeout: Duration::from_millis(100),
                ..AbandonedConfig::default()
            })
            .build(factory);

        let straggler = pool.borrow().await.unwrap();
        wait_until(|| pool.num_active() == 0 && pool.num_idle() == 0).await;

        // Capacity is free again; a fresh instance is created.
        let second = pool.borrow().await.unwrap();
        assert_eq!(*second, 2);

        // The straggler is destroyed with the abandoned reason on release.
        drop(straggler);
        wait_until(|| counters.destroyed_abandoned.load(Ordering::SeqCst) == 1).await;

        pool.close().await;
    }

    #[tokio::test]
    async fn abandoned_sweep_on_borrow_frees_capacity() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder()
            .max_total(1)
            .abandoned_config(AbandonedConfig {
                remove_on_borrow: true,
                timeout: Duration::from_millis(50),
                ..AbandonedConfig::default()
            })
            .build(factory);

        let _straggler = pool.borrow().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let reclaimed = pool.borrow_timeout(Some(Duration::from_millis(200))).await;
        assert_eq!(*reclaimed.unwrap(), 2);
    }

    #[tokio::test]
    async fn touching_the_guard_defers_abandonment() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder()
            .max_total(1)
            .abandoned_config(AbandonedConfig {
                remove_on_maintenance: true,
                timeout: Duration::from_millis(120),
                ..AbandonedConfig::default()
            })
            .build(factory);

        let guard = pool.borrow().await.unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            guard.touch();
            pool.evict().await.unwrap();
        }
        assert_eq!(pool.num_active(), 1, "touched object must survive sweeps");
    }

    #[tokio::test]
    async fn evict_destroys_stale_idle_entries() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder()
            .max_total(4)
            .min_evictable_idle(Duration::from_millis(30))
            .build(factory);

        pool.add_object().await.unwrap();
        pool.add_object().await.unwrap();
        assert_eq!(pool.num_idle(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.evict().await.unwrap();

        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.status().destroyed_by_evictor, 2);
    }

    #[tokio::test]
    async fn evict_respects_the_per_run_budget() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder()
            .max_total(4)
            .num_tests_per_eviction_run(1)
            .min_evictable_idle(Duration::from_millis(10))
            .build(factory);

        for _ in 0..3 {
            pool.add_object().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        pool.evict().await.unwrap();
        assert_eq!(pool.num_idle(), 2);
        pool.evict().await.unwrap();
        assert_eq!(pool.num_idle(), 1);
    }

    #[tokio::test]
    async fn idle_health_checks_destroy_failing_instances() {
        let (factory, counters) = TestFactory::new();
        let factory = factory.failing_validation(u64::MAX);
        let pool = Pool::builder()
            .max_total(4)
            .test_while_idle(true)
            .min_evictable_idle(None)
            .build(factory);

        pool.add_object().await.unwrap();
        pool.add_object().await.unwrap();
        pool.evict().await.unwrap();

        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.status().destroyed_by_evictor, 2);
        assert!(counters.activated.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn waiters_are_served_in_enrollment_order() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder().max_total(1).fairness(true).build(factory);

        let held = pool.borrow().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut waiters = Vec::new();
        for index in 0..3 {
            let worker = pool.clone();
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let guard = worker
                    .borrow_timeout(Some(Duration::from_secs(5)))
                    .await
                    .unwrap();
                order.lock().unwrap().push(index);
                worker.return_object(guard).await.unwrap();
            }));
            wait_until(|| pool.num_waiters() == index + 1).await;
        }

        pool.return_object(held).await.unwrap();
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn clear_spares_borrowed_instances() {
        let (factory, counters) = TestFactory::new();
        let pool = Pool::builder().max_total(4).build(factory);

        let held = pool.borrow().await.unwrap();
        pool.add_object().await.unwrap();
        pool.add_object().await.unwrap();

        pool.clear().await;
        assert_eq!(pool.num_idle(), 0);
        assert_eq!(pool.num_active(), 1);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 2);

        // The survivor still belongs to the pool and returns normally.
        pool.return_object(held).await.unwrap();
        assert_eq!(pool.num_idle(), 1);
    }

    #[tokio::test]
    async fn make_failures_propagate_to_the_borrower() {
        let (factory, _counters) = TestFactory::new();
        factory.fail_make.store(true, Ordering::SeqCst);
        let pool = Pool::builder().max_total(2).build(factory);

        match pool.borrow().await {
            Err(PoolError::Factory { phase, .. }) => assert_eq!(phase, FactoryPhase::Make),
            other => panic!("expected factory failure, got {other:?}"),
        }
        // The failed creation must not leak gate capacity.
        assert_eq!(pool.shared.create_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn status_reports_identity_and_counters() {
        let (factory, _counters) = TestFactory::new();
        let pool = Pool::builder()
            .name("upstream-connections")
            .max_total(2)
            .build(factory);

        let guard = pool.borrow().await.unwrap();
        pool.return_object(guard).await.unwrap();

        let status = pool.status();
        assert_eq!(status.name.as_deref(), Some("upstream-connections"));
        assert!(status.created_at.contains("pool.rs"));
        assert_eq!(status.borrowed, 1);
        assert_eq!(status.returned, 1);
        assert_eq!(status.num_idle, 1);
        assert!(status.swallowed_errors.is_empty());
    }
}
