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
use crate::config::KeyedPoolConfig;
use crate::deque::IdleDeque;
use crate::entry::{EntryState, EvictionTestEnd, PooledEntry};
use crate::error::{FactoryPhase, PoolError};
use crate::evictor::{self, EvictorRegistration, MaintenanceJob};
use crate::factory::{DestroyReason, KeyedPoolableFactory, PoolKey, TrackedUse};
use crate::policy::{EvictionConfig, EvictionPolicy, EvictionPolicyChoice};
use crate::pool::{eviction_test_budget, DestroyCause};
use crate::stats::{PoolStats, PoolStatus};

/// One key's slice of a [`KeyedPool`]: its own idle deque, registry, and
/// creation gate.
struct SubPool<T> {
    idle: IdleDeque<T>,
    live: Mutex<HashMap<u64, Arc<PooledEntry<T>>>>,
    // Registered instances plus in-flight creations for this key.
    create_count: AtomicIsize,
}

impl<T> SubPool<T> {
    fn new() -> Self {
        SubPool {
            idle: IdleDeque::new(),
            live: Mutex::new(HashMap::new()),
            create_count: AtomicIsize::new(0),
        }
    }
}

struct Registry<K, T> {
    pools: HashMap<K, Arc<SubPool<T>>>,
    // Insertion-ordered key list backing the round-robin cursors.
    keys: Vec<K>,
    reclaim_cursor: usize,
    evict_cursor: usize,
    closed: bool,
}

struct KeyedShared<K: PoolKey, M: KeyedPoolableFactory<K>> {
    factory: M,
    config: KeyedPoolConfig,
    abandoned: Option<AbandonedConfig>,
    policy: Arc<dyn EvictionPolicy>,
    runtime: Handle,
    created_at: &'static Location<'static>,
    registry: Mutex<Registry<K, M::Object>>,
    // Global creation gate across all keys.
    create_count: AtomicIsize,
    entry_seq: AtomicU64,
    stats: PoolStats,
    evictor: Mutex<Option<EvictorRegistration>>,
}

/// A pool maintaining a logically separate sub-pool per key.
///
/// Behaves as a collection of [`Pool`](crate::Pool)s sharing one global
/// instance cap. When a creation for one key collides with the global cap,
/// an idle instance of another key (selected round-robin) is destroyed to
/// make room.
pub struct KeyedPool<K: PoolKey, M: KeyedPoolableFactory<K>> {
    shared: Arc<KeyedShared<K, M>>,
}

impl<K: PoolKey, M: KeyedPoolableFactory<K>> Clone for KeyedPool<K, M> {
    fn clone(&self) -> Self {
        KeyedPool {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K: PoolKey, M: KeyedPoolableFactory<K>> fmt::Debug for KeyedPool<K, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedPool")
            .field("name", &self.shared.config.common.name)
            .field("num_idle", &self.num_idle())
            .finish()
    }
}

/// Configures and constructs a [`KeyedPool`].
pub struct KeyedPoolBuilder<K: PoolKey, M: KeyedPoolableFactory<K>> {
    config: KeyedPoolConfig,
    abandoned: Option<AbandonedConfig>,
    policy: EvictionPolicyChoice,
    _marker: PhantomData<(K, M)>,
}

impl<K: PoolKey, M: KeyedPoolableFactory<K>> Default for KeyedPoolBuilder<K, M> {
    fn default() -> Self {
        KeyedPoolBuilder {
            config: KeyedPoolConfig::default(),
            abandoned: None,
            policy: EvictionPolicyChoice::Default,
            _marker: PhantomData,
        }
    }
}

impl<K: PoolKey, M: KeyedPoolableFactory<K>> KeyedPoolBuilder<K, M> {
    pub fn new() -> Self {
        Default::default()
    }

    /// Starts from an existing configuration.
    pub fn from_config(config: KeyedPoolConfig) -> Self {
        KeyedPoolBuilder {
            config,
            ..Default::default()
        }
    }

    /// Cap on instances across all keys. `None` is unlimited, the default.
    pub fn max_total(mut self, max_total: impl Into<Option<usize>>) -> Self {
        self.config.max_total = max_total.into();
        self
    }

    /// Cap on instances per key. `None` is unlimited. Defaults to 8.
    pub fn max_total_per_key(mut self, max: impl Into<Option<usize>>) -> Self {
        self.config.max_total_per_key = max.into();
        self
    }

    /// Cap on idle instances retained per key. `None` is unlimited.
    /// Defaults to 8.
    pub fn max_idle_per_key(mut self, max: impl Into<Option<usize>>) -> Self {
        self.config.max_idle_per_key = max.into();
        self
    }

    /// Idle floor replenished per key by maintenance. Defaults to 0.
    pub fn min_idle_per_key(mut self, min: usize) -> Self {
        self.config.min_idle_per_key = min;
        self
    }

    /// Idle polarity. Defaults to `true`.
    pub fn lifo(mut self, lifo: bool) -> Self {
        self.config.common.lifo = lifo;
        self
    }

    /// Retained for configuration compatibility; handoff is always
    /// enrollment-ordered per key.
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

    /// Idle instances examined per maintenance run across all keys.
    pub fn num_tests_per_eviction_run(mut self, tests: i32) -> Self {
        self.config.common.num_tests_per_eviction_run = tests;
        self
    }

    /// Hard idle eviction threshold. Defaults to 30 minutes.
    pub fn min_evictable_idle(mut self, idle: impl Into<Option<Duration>>) -> Self {
        self.config.common.min_evictable_idle = idle.into();
        self
    }

    /// Soft idle eviction threshold, honored above the per-key idle floor.
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

    /// Builds the pool. Must be called within a Tokio runtime.
    #[track_caller]
    pub fn build(self, factory: M) -> KeyedPool<K, M> {
        let created_at = Location::caller();
        let policy = self.policy.resolve();
        let interval = self.config.common.time_between_eviction_runs;
        let shared = Arc::new(KeyedShared {
            factory,
            config: self.config,
            abandoned: self.abandoned,
            policy,
            runtime: Handle::current(),
            created_at,
            registry: Mutex::new(Registry {
                pools: HashMap::new(),
                keys: Vec::new(),
                reclaim_cursor: 0,
                evict_cursor: 0,
                closed: false,
            }),
            create_count: AtomicIsize::new(0),
            entry_seq: AtomicU64::new(1),
            stats: PoolStats::new(),
            evictor: Mutex::new(None),
        });
        let pool = KeyedPool { shared };
        pool.set_eviction_interval(interval);
        debug!(
            name = pool.shared.config.common.name.as_deref().unwrap_or(""),
            at = %created_at,
            "keyed pool created"
        );
        pool
    }
}

impl<K: PoolKey, M: KeyedPoolableFactory<K>> KeyedPool<K, M> {
    /// Returns a builder to configure a new keyed pool.
    pub fn builder() -> KeyedPoolBuilder<K, M> {
        KeyedPoolBuilder::new()
    }

    /// Builds a keyed pool with the default configuration.
    #[track_caller]
    pub fn new(factory: M) -> KeyedPool<K, M> {
        KeyedPoolBuilder::new().build(factory)
    }

    /// Borrows an instance for `key`, waiting up to the configured
    /// `max_wait`.
    pub async fn borrow(&self, key: &K) -> Result<KeyedPooled<K, M>, PoolError<M::Error>> {
        self.borrow_timeout(key, self.shared.config.common.max_wait)
            .await
    }

    /// Borrows an instance for `key`, waiting up to `max_wait` (forever when
    /// `None`) if no capacity is available and blocking is enabled.
    pub async fn borrow_timeout(
        &self,
        key: &K,
        max_wait: Option<Duration>,
    ) -> Result<KeyedPooled<K, M>, PoolError<M::Error>> {
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
            let sub = self.subpool(key)?;

            let mut freshly_created = false;
            let polled = match sub.idle.try_poll_first() {
                Some(entry) => Some(entry),
                None => match self.try_create(key, &sub).await? {
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
                    match sub.idle.poll_first(remaining).await {
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
                None => continue,
            };

            if let Err(error) = self.shared.factory.activate(key, &mut obj).await {
                self.destroy_entry(
                    key,
                    &sub,
                    &entry,
                    Some(obj),
                    DestroyReason::Normal,
                    DestroyCause::Regular,
                )
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
                let valid = self.shared.factory.validate(key, &mut obj).await;
                entry.end_validation();
                if !valid {
                    self.destroy_entry(
                        key,
                        &sub,
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
            trace!(entry = entry.id(), key = ?key, "object borrowed");
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
            return Ok(KeyedPooled {
                key: Some(key.clone()),
                obj: Some(obj),
                entry: Some(entry),
                sub: Some(sub),
                pool: Arc::downgrade(&self.shared),
                track_usage,
                log_abandoned,
                full_trace,
            });
        }
    }

    /// Returns a borrowed instance to its sub-pool.
    pub async fn return_object(&self, guard: KeyedPooled<K, M>) -> Result<(), PoolError<M::Error>> {
        let (key, sub, entry, obj) = self.claim_guard(guard)?;
        self.return_inner(&key, &sub, entry, obj).await
    }

    /// Destroys a borrowed instance instead of returning it.
    pub async fn invalidate_object(
        &self,
        guard: KeyedPooled<K, M>,
    ) -> Result<(), PoolError<M::Error>> {
        self.invalidate_object_with_reason(guard, DestroyReason::Normal)
            .await
    }

    /// Destroys a borrowed instance, passing `reason` to the factory.
    pub async fn invalidate_object_with_reason(
        &self,
        guard: KeyedPooled<K, M>,
        reason: DestroyReason,
    ) -> Result<(), PoolError<M::Error>> {
        let (key, sub, entry, obj) = self.claim_guard(guard)?;
        let registered = { sub.live.lock().unwrap().contains_key(&entry.id()) };
        if !registered {
            if self.shared.abandoned.is_some() {
                if let Err(error) = self
                    .shared
                    .factory
                    .destroy(&key, obj, DestroyReason::Abandoned)
                    .await
                {
                    self.shared.stats.swallow("destroy", &error);
                }
                return Ok(());
            }
            return Err(PoolError::Foreign);
        }
        self.destroy_entry(&key, &sub, &entry, Some(obj), reason, DestroyCause::Regular)
            .await;
        self.ensure_idle_key(&key, &sub, 1, false).await?;
        self.reuse_capacity().await;
        Ok(())
    }

    /// Creates an instance for `key`, passivates it, and parks it idle.
    /// Does nothing when the pool is at capacity.
    pub async fn add_object(&self, key: &K) -> Result<(), PoolError<M::Error>> {
        self.ensure_open()?;
        let sub = self.subpool(key)?;
        let Some(mut obj) = self.create_raw(key, &sub).await? else {
            return Ok(());
        };

        if let Err(error) = self.shared.factory.passivate(key, &mut obj).await {
            self.release_gates(&sub);
            self.shared.stats.destroyed.fetch_add(1, Ordering::Relaxed);
            if let Err(destroy_error) = self
                .shared
                .factory
                .destroy(key, obj, DestroyReason::Normal)
                .await
            {
                self.shared.stats.swallow("destroy", &destroy_error);
            }
            return Err(PoolError::Factory {
                phase: FactoryPhase::Passivate,
                source: error,
            });
        }

        match self.register(key, &sub, obj) {
            Ok(entry) => {
                if self.shared.config.common.lifo {
                    sub.idle.offer_first(entry);
                } else {
                    sub.idle.offer_last(entry);
                }
                if self.is_closed() {
                    // Closed while the add was in flight; sweep what we added.
                    self.clear_sub(key, &sub).await;
                }
                Ok(())
            }
            Err(obj) => {
                self.release_gates(&sub);
                self.shared.stats.destroyed.fetch_add(1, Ordering::Relaxed);
                if let Err(error) = self
                    .shared
                    .factory
                    .destroy(key, obj, DestroyReason::Normal)
                    .await
                {
                    self.shared.stats.swallow("destroy", &error);
                }
                Err(PoolError::Closed)
            }
        }
    }

    /// Destroys every idle instance across all keys.
    pub async fn clear(&self) {
        let subs = self.all_subpools();
        for (key, sub) in subs {
            self.clear_sub(&key, &sub).await;
        }
    }

    /// Destroys every idle instance held for `key`. Borrowed instances are
    /// unaffected.
    pub async fn clear_key(&self, key: &K) {
        let sub = {
            let registry = self.shared.registry.lock().unwrap();
            registry.pools.get(key).cloned()
        };
        if let Some(sub) = sub {
            self.clear_sub(key, &sub).await;
        }
    }

    /// Closes the pool: stops maintenance, destroys idle instances of every
    /// key, and wakes all suspended borrowers. Idempotent.
    pub async fn close(&self) {
        {
            let mut registry = self.shared.registry.lock().unwrap();
            if registry.closed {
                return;
            }
            registry.closed = true;
        }
        debug!(
            name = self.shared.config.common.name.as_deref().unwrap_or(""),
            "closing keyed pool"
        );
        *self.shared.evictor.lock().unwrap() = None;
        self.clear().await;
        for (_, sub) in self.all_subpools() {
            sub.idle.interrupt_takers();
        }
    }

    /// One maintenance pass over every key, oldest idle first, resuming from
    /// the round-robin eviction cursor.
    pub async fn evict(&self) -> Result<(), PoolError<M::Error>> {
        self.ensure_open()?;
        let tests = self.shared.config.common.num_tests_per_eviction_run;
        let subs = {
            let mut registry = self.shared.registry.lock().unwrap();
            let count = registry.keys.len();
            if count == 0 {
                Vec::new()
            } else {
                let begin = registry.evict_cursor % count;
                registry.evict_cursor = (begin + 1) % count;
                (0..count)
                    .map(|offset| registry.keys[(begin + offset) % count].clone())
                    .filter_map(|key| {
                        registry
                            .pools
                            .get(&key)
                            .map(|sub| (key.clone(), Arc::clone(sub)))
                    })
                    .collect()
            }
        };

        let total_idle: usize = subs.iter().map(|(_, sub)| sub.idle.len()).sum();
        if total_idle > 0 && tests != 0 {
            let budget = eviction_test_budget(tests, total_idle);
            let eviction_config = EvictionConfig {
                idle_evict_time: self.shared.config.common.min_evictable_idle,
                idle_soft_evict_time: self.shared.config.common.soft_min_evictable_idle,
                min_idle: self.shared.config.min_idle_per_key,
            };

            let mut tested = 0;
            'keys: for (key, sub) in &subs {
                let mut candidates = sub.idle.snapshot();
                if self.shared.config.common.lifo {
                    candidates.reverse();
                }
                for entry in candidates {
                    if tested == budget {
                        break 'keys;
                    }
                    let Some(mut obj) = entry.start_eviction_test() else {
                        continue;
                    };
                    tested += 1;

                    let candidate = entry.eviction_candidate();
                    if self
                        .shared
                        .policy
                        .evict(&eviction_config, &candidate, sub.idle.len())
                    {
                        trace!(entry = entry.id(), key = ?key, "evicting idle object");
                        self.destroy_entry(
                            key,
                            sub,
                            &entry,
                            Some(obj),
                            DestroyReason::Normal,
                            DestroyCause::Evictor,
                        )
                        .await;
                        continue;
                    }

                    if self.shared.config.common.test_while_idle {
                        let healthy = match self.shared.factory.activate(key, &mut obj).await {
                            Ok(()) => {
                                if self.shared.factory.validate(key, &mut obj).await {
                                    match self.shared.factory.passivate(key, &mut obj).await {
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
                                key,
                                sub,
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
                        EvictionTestEnd::ReturnToHead => sub.idle.offer_first(entry),
                        EvictionTestEnd::Dead(obj) => {
                            if let Err(error) = self
                                .shared
                                .factory
                                .destroy(key, obj, DestroyReason::Normal)
                                .await
                            {
                                self.shared.stats.swallow("destroy", &error);
                            }
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
        self.prune_empty_subpools();
        Ok(())
    }

    /// Tops every key's idle set up to `min_idle_per_key`, capacity
    /// permitting.
    pub async fn ensure_min_idle(&self) -> Result<(), PoolError<M::Error>> {
        let target = self.shared.config.min_idle_per_key;
        if target == 0 {
            return Ok(());
        }
        for (key, sub) in self.all_subpools() {
            self.ensure_idle_key(&key, &sub, target, true).await?;
        }
        Ok(())
    }

    /// Instances currently borrowed, across all keys.
    pub fn num_active(&self) -> usize {
        self.all_subpools()
            .iter()
            .map(|(_, sub)| {
                let live = sub.live.lock().unwrap().len();
                live.saturating_sub(sub.idle.len())
            })
            .sum()
    }

    /// Instances currently idle, across all keys.
    pub fn num_idle(&self) -> usize {
        self.all_subpools()
            .iter()
            .map(|(_, sub)| sub.idle.len())
            .sum()
    }

    /// Instances currently borrowed for `key`.
    pub fn num_active_key(&self, key: &K) -> usize {
        let registry = self.shared.registry.lock().unwrap();
        registry.pools.get(key).map_or(0, |sub| {
            let live = sub.live.lock().unwrap().len();
            live.saturating_sub(sub.idle.len())
        })
    }

    /// Instances currently idle for `key`.
    pub fn num_idle_key(&self, key: &K) -> usize {
        let registry = self.shared.registry.lock().unwrap();
        registry.pools.get(key).map_or(0, |sub| sub.idle.len())
    }

    /// Borrowed counts broken down by key.
    pub fn num_active_per_key(&self) -> HashMap<K, usize> {
        self.all_subpools()
            .into_iter()
            .map(|(key, sub)| {
                let live = sub.live.lock().unwrap().len();
                (key, live.saturating_sub(sub.idle.len()))
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.registry.lock().unwrap().closed
    }

    /// A point-in-time snapshot of population and counters.
    pub fn status(&self) -> PoolStatus {
        let stats = self.shared.stats.snapshot();
        PoolStatus {
            name: self.shared.config.common.name.clone(),
            created_at: self.shared.created_at.to_string(),
            num_active: self.num_active(),
            num_idle: self.num_idle(),
            num_waiters: self
                .all_subpools()
                .iter()
                .map(|(_, sub)| sub.idle.taker_count())
                .sum(),
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
                let pool = KeyedPool { shared };
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
        if self.num_idle() >= 2 {
            return false;
        }
        match self.shared.config.max_total {
            Some(max_total) => self.num_active() as isize > max_total as isize - 3,
            None => false,
        }
    }

    fn subpool(&self, key: &K) -> Result<Arc<SubPool<M::Object>>, PoolError<M::Error>> {
        let mut registry = self.shared.registry.lock().unwrap();
        if registry.closed {
            return Err(PoolError::Closed);
        }
        if let Some(sub) = registry.pools.get(key) {
            return Ok(Arc::clone(sub));
        }
        let sub = Arc::new(SubPool::new());
        registry.pools.insert(key.clone(), Arc::clone(&sub));
        registry.keys.push(key.clone());
        trace!(key = ?key, "sub-pool created");
        Ok(sub)
    }

    fn all_subpools(&self) -> Vec<(K, Arc<SubPool<M::Object>>)> {
        let registry = self.shared.registry.lock().unwrap();
        registry
            .keys
            .iter()
            .filter_map(|key| {
                registry
                    .pools
                    .get(key)
                    .map(|sub| (key.clone(), Arc::clone(sub)))
            })
            .collect()
    }

    fn reserve_per_key(&self, sub: &SubPool<M::Object>) -> bool {
        let cap = self.shared.config.max_total_per_key;
        sub.create_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| match cap {
                Some(limit) if current >= limit as isize => None,
                _ => Some(current + 1),
            })
            .is_ok()
    }

    fn reserve_global(&self) -> bool {
        let cap = self.shared.config.max_total;
        self.shared
            .create_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| match cap {
                Some(limit) if current >= limit as isize => None,
                _ => Some(current + 1),
            })
            .is_ok()
    }

    /// Reserves both creation gates and runs the factory, or returns `None`
    /// when either the per-key or the global gate refuses. A global-cap
    /// refusal first tries to reclaim an idle instance from another key.
    async fn create_raw(
        &self,
        key: &K,
        sub: &Arc<SubPool<M::Object>>,
    ) -> Result<Option<M::Object>, PoolError<M::Error>> {
        if !self.reserve_per_key(sub) {
            return Ok(None);
        }
        loop {
            if self.reserve_global() {
                break;
            }
            if !self.reclaim_one_idle(key).await {
                sub.create_count.fetch_sub(1, Ordering::SeqCst);
                return Ok(None);
            }
        }

        match self.shared.factory.make(key).await {
            Ok(obj) => {
                self.shared.stats.created.fetch_add(1, Ordering::Relaxed);
                Ok(Some(obj))
            }
            Err(error) => {
                self.release_gates(sub);
                Err(PoolError::Factory {
                    phase: FactoryPhase::Make,
                    source: error,
                })
            }
        }
    }

    fn release_gates(&self, sub: &SubPool<M::Object>) {
        sub.create_count.fetch_sub(1, Ordering::SeqCst);
        self.shared.create_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn register(
        &self,
        key: &K,
        sub: &Arc<SubPool<M::Object>>,
        obj: M::Object,
    ) -> Result<Arc<PooledEntry<M::Object>>, M::Object> {
        let id = self.shared.entry_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(PooledEntry::new(id, obj));
        if self.is_closed() {
            let obj = entry.invalidate().expect("fresh entry holds its object");
            return Err(obj);
        }
        sub.live.lock().unwrap().insert(id, Arc::clone(&entry));
        trace!(entry = id, key = ?key, "object created");
        Ok(entry)
    }

    /// Creates and registers one idle-state instance for `key`.
    async fn try_create(
        &self,
        key: &K,
        sub: &Arc<SubPool<M::Object>>,
    ) -> Result<Option<Arc<PooledEntry<M::Object>>>, PoolError<M::Error>> {
        let Some(obj) = self.create_raw(key, sub).await? else {
            return Ok(None);
        };
        match self.register(key, sub, obj) {
            Ok(entry) => Ok(Some(entry)),
            Err(obj) => {
                self.release_gates(sub);
                self.shared.stats.destroyed.fetch_add(1, Ordering::Relaxed);
                if let Err(error) = self
                    .shared
                    .factory
                    .destroy(key, obj, DestroyReason::Normal)
                    .await
                {
                    self.shared.stats.swallow("destroy", &error);
                }
                Err(PoolError::Closed)
            }
        }
    }

    /// Destroys the oldest idle instance of some other key, advancing the
    /// round-robin cursor. Returns `false` when no other key has an idle
    /// instance to give up.
    async fn reclaim_one_idle(&self, requester: &K) -> bool {
        let victim = {
            let mut registry = self.shared.registry.lock().unwrap();
            let count = registry.keys.len();
            let mut found = None;
            for _ in 0..count {
                registry.reclaim_cursor = (registry.reclaim_cursor + 1) % count;
                let key = registry.keys[registry.reclaim_cursor].clone();
                if &key == requester {
                    continue;
                }
                if let Some(sub) = registry.pools.get(&key) {
                    if let Some(entry) =
                        sub.idle.try_poll_oldest(self.shared.config.common.lifo)
                    {
                        found = Some((key, Arc::clone(sub), entry));
                        break;
                    }
                }
            }
            found
        };

        match victim {
            Some((key, sub, entry)) => {
                debug!(key = ?key, "reclaiming idle instance for another key");
                self.destroy_entry(
                    &key,
                    &sub,
                    &entry,
                    None,
                    DestroyReason::Normal,
                    DestroyCause::Regular,
                )
                .await;
                true
            }
            None => false,
        }
    }

    /// After a destroy frees globally capped capacity, creates for the key
    /// with the most suspended borrowers so cross-key waiters do not starve.
    async fn reuse_capacity(&self) {
        if self.shared.config.max_total.is_none() {
            return;
        }
        let target = {
            let registry = self.shared.registry.lock().unwrap();
            registry
                .keys
                .iter()
                .filter_map(|key| {
                    registry.pools.get(key).map(|sub| {
                        (key.clone(), Arc::clone(sub), sub.idle.taker_count())
                    })
                })
                .filter(|(_, _, takers)| *takers > 0)
                .max_by_key(|(_, _, takers)| *takers)
                .map(|(key, sub, _)| (key, sub))
        };
        if let Some((key, sub)) = target {
            match self.try_create(&key, &sub).await {
                Ok(Some(entry)) => {
                    if self.shared.config.common.lifo {
                        sub.idle.offer_first(entry);
                    } else {
                        sub.idle.offer_last(entry);
                    }
                }
                Ok(None) => {}
                Err(error) => self.shared.stats.swallow("reuse-capacity", &error),
            }
        }
    }

    async fn ensure_idle_key(
        &self,
        key: &K,
        sub: &Arc<SubPool<M::Object>>,
        target: usize,
        always: bool,
    ) -> Result<(), PoolError<M::Error>> {
        if !always && !sub.idle.has_takers() {
            return Ok(());
        }
        let mut created = 0;
        while sub.idle.len() < target && created < target {
            if self.is_closed() {
                break;
            }
            let Some(entry) = self.try_create(key, sub).await? else {
                break;
            };
            created += 1;
            if self.shared.config.common.lifo {
                sub.idle.offer_first(entry);
            } else {
                sub.idle.offer_last(entry);
            }
        }
        if created > 0 && self.is_closed() {
            self.clear_sub(key, sub).await;
        }
        Ok(())
    }

    fn claim_guard(
        &self,
        mut guard: KeyedPooled<K, M>,
    ) -> Result<
        (
            K,
            Arc<SubPool<M::Object>>,
            Arc<PooledEntry<M::Object>>,
            M::Object,
        ),
        PoolError<M::Error>,
    > {
        let owned_here = guard
            .pool
            .upgrade()
            .map_or(false, |shared| Arc::ptr_eq(&shared, &self.shared));
        if !owned_here {
            return Err(PoolError::Foreign);
        }
        let key = guard.key.take().expect("guard already consumed");
        let sub = guard.sub.take().expect("guard already consumed");
        let entry = guard.entry.take().expect("guard already consumed");
        let obj = guard.obj.take().expect("guard already consumed");
        Ok((key, sub, entry, obj))
    }

    async fn return_inner(
        &self,
        key: &K,
        sub: &Arc<SubPool<M::Object>>,
        entry: Arc<PooledEntry<M::Object>>,
        mut obj: M::Object,
    ) -> Result<(), PoolError<M::Error>> {
        let registered = { sub.live.lock().unwrap().contains_key(&entry.id()) };
        if !registered {
            let reason = if entry.state() == EntryState::Abandoned {
                DestroyReason::Abandoned
            } else {
                DestroyReason::Normal
            };
            if let Err(error) = self.shared.factory.destroy(key, obj, reason).await {
                self.shared.stats.swallow("destroy", &error);
            }
            return Ok(());
        }

        if !entry.mark_returning() {
            return Err(PoolError::DoubleReturn);
        }

        self.shared.stats.record_return(entry.active_duration());

        if self.shared.config.common.test_on_return
            && !self.shared.factory.validate(key, &mut obj).await
        {
            self.destroy_entry(
                key,
                sub,
                &entry,
                Some(obj),
                DestroyReason::Normal,
                DestroyCause::Regular,
            )
            .await;
            self.ensure_idle_key(key, sub, 1, false).await?;
            self.reuse_capacity().await;
            return Ok(());
        }

        if let Err(error) = self.shared.factory.passivate(key, &mut obj).await {
            self.shared.stats.swallow("passivate", &error);
            self.destroy_entry(
                key,
                sub,
                &entry,
                Some(obj),
                DestroyReason::Normal,
                DestroyCause::Regular,
            )
            .await;
            self.ensure_idle_key(key, sub, 1, false).await?;
            self.reuse_capacity().await;
            return Ok(());
        }

        let closed = self.is_closed();
        let over_capacity = self
            .shared
            .config
            .max_idle_per_key
            .map_or(false, |limit| sub.idle.len() >= limit);
        if closed || over_capacity {
            self.destroy_entry(
                key,
                sub,
                &entry,
                Some(obj),
                DestroyReason::Normal,
                DestroyCause::Regular,
            )
            .await;
            if !closed {
                self.ensure_idle_key(key, sub, 1, false).await?;
                self.reuse_capacity().await;
            }
            return Ok(());
        }

        entry.deallocate(obj);
        trace!(entry = entry.id(), key = ?key, "object returned to idle set");
        if self.shared.config.common.lifo {
            sub.idle.offer_first(entry);
        } else {
            sub.idle.offer_last(entry);
        }
        if self.is_closed() {
            self.clear_sub(key, sub).await;
        }
        Ok(())
    }

    async fn clear_sub(&self, key: &K, sub: &Arc<SubPool<M::Object>>) {
        while let Some(entry) = sub.idle.try_poll_first() {
            self.destroy_entry(
                key,
                sub,
                &entry,
                None,
                DestroyReason::Normal,
                DestroyCause::Regular,
            )
            .await;
        }
    }

    async fn destroy_entry(
        &self,
        key: &K,
        sub: &Arc<SubPool<M::Object>>,
        entry: &Arc<PooledEntry<M::Object>>,
        owned: Option<M::Object>,
        reason: DestroyReason,
        cause: DestroyCause,
    ) {
        let parked = entry.invalidate();
        let obj = owned.or(parked);
        sub.idle.remove(entry);
        let deregistered = { sub.live.lock().unwrap().remove(&entry.id()).is_some() };
        if deregistered {
            sub.create_count.fetch_sub(1, Ordering::SeqCst);
            self.shared.create_count.fetch_sub(1, Ordering::SeqCst);
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
            if let Err(error) = self.shared.factory.destroy(key, obj, reason).await {
                self.shared.stats.swallow("destroy", &error);
            }
        }
        trace!(entry = entry.id(), key = ?key, "entry destroyed");
    }

    async fn remove_abandoned(&self, config: &AbandonedConfig) {
        let now = Instant::now();
        let candidates: Vec<(K, Arc<SubPool<M::Object>>, Arc<PooledEntry<M::Object>>)> = {
            let registry = self.shared.registry.lock().unwrap();
            registry
                .keys
                .iter()
                .filter_map(|key| registry.pools.get(key).map(|sub| (key, sub)))
                .flat_map(|(key, sub)| {
                    let live = sub.live.lock().unwrap();
                    live.values()
                        .filter(|entry| entry.is_abandoned_candidate(now, config.timeout))
                        .map(|entry| (key.clone(), Arc::clone(sub), Arc::clone(entry)))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for (key, sub, entry) in candidates {
            if !entry.mark_abandoned() {
                continue;
            }
            let removed = { sub.live.lock().unwrap().remove(&entry.id()).is_some() };
            if removed {
                sub.create_count.fetch_sub(1, Ordering::SeqCst);
                self.shared.create_count.fetch_sub(1, Ordering::SeqCst);
                self.shared.stats.destroyed.fetch_add(1, Ordering::Relaxed);
                if config.log_abandoned {
                    warn!(
                        entry = entry.id(),
                        key = ?key,
                        borrowed_by = entry.borrowed_by().as_deref().unwrap_or("<not captured>"),
                        "reclaimed abandoned object"
                    );
                } else {
                    debug!(entry = entry.id(), key = ?key, "reclaimed abandoned object");
                }
            }
        }
    }

    /// Drops sub-pools with nothing going on: no instances, no in-flight
    /// creations, no suspended borrowers.
    fn prune_empty_subpools(&self) {
        let mut registry = self.shared.registry.lock().unwrap();
        let removable: Vec<K> = registry
            .pools
            .iter()
            .filter(|(_, sub)| {
                sub.create_count.load(Ordering::SeqCst) == 0
                    && sub.idle.len() == 0
                    && sub.live.lock().unwrap().is_empty()
                    && !sub.idle.has_takers()
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in removable {
            trace!(key = ?key, "pruning empty sub-pool");
            registry.pools.remove(&key);
            registry.keys.retain(|candidate| candidate != &key);
        }
        let count = registry.keys.len();
        if count == 0 {
            registry.reclaim_cursor = 0;
            registry.evict_cursor = 0;
        } else {
            registry.reclaim_cursor %= count;
            registry.evict_cursor %= count;
        }
    }

    #[cfg(test)]
    fn subpool_count(&self) -> usize {
        self.shared.registry.lock().unwrap().pools.len()
    }
}

/// A borrowed instance from a [`KeyedPool`].
///
/// Dereferences to the factory's object type. Dropping the guard schedules
/// the return on the pool's runtime; [`KeyedPool::return_object`] performs
/// it eagerly.
pub struct KeyedPooled<K: PoolKey, M: KeyedPoolableFactory<K>> {
    key: Option<K>,
    obj: Option<M::Object>,
    entry: Option<Arc<PooledEntry<M::Object>>>,
    sub: Option<Arc<SubPool<M::Object>>>,
    pool: Weak<KeyedShared<K, M>>,
    track_usage: bool,
    log_abandoned: bool,
    full_trace: bool,
}

impl<K: PoolKey, M: KeyedPoolableFactory<K>> KeyedPooled<K, M> {
    /// The key this instance belongs to.
    pub fn key(&self) -> &K {
        self.key.as_ref().expect("key already taken")
    }

    /// Notifies the abandonment tracker that the instance is in use.
    pub fn touch(&self) {
        if let Some(entry) = &self.entry {
            entry.touch();
        }
    }
}

impl<K: PoolKey, M: KeyedPoolableFactory<K>> KeyedPooled<K, M>
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

impl<K: PoolKey, M: KeyedPoolableFactory<K>> Deref for KeyedPooled<K, M> {
    type Target = M::Object;

    fn deref(&self) -> &M::Object {
        self.obj.as_ref().expect("object already taken")
    }
}

impl<K: PoolKey, M: KeyedPoolableFactory<K>> DerefMut for KeyedPooled<K, M> {
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

impl<K: PoolKey, M: KeyedPoolableFactory<K>> fmt::Debug for KeyedPooled<K, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedPooled")
            .field("key", &self.key)
            .field("entry", &self.entry.as_ref().map(|entry| entry.id()))
            .finish()
    }
}

impl<K: PoolKey, M: KeyedPoolableFactory<K>> Drop for KeyedPooled<K, M> {
    fn drop(&mut self) {
        let (Some(key), Some(obj), Some(entry), Some(sub)) = (
            self.key.take(),
            self.obj.take(),
            self.entry.take(),
            self.sub.take(),
        ) else {
            return;
        };
        if let Some(shared) = self.pool.upgrade() {
            let pool = KeyedPool { shared };
            let runtime = pool.shared.runtime.clone();
            runtime.spawn(async move {
                if let Err(error) = pool.return_inner(&key, &sub, entry, obj).await {
                    pool.shared.stats.swallow("return", &error);
                }
            });
        } else {
            trace!("keyed pool dropped before its borrowed object came back");
        }
    }
}
