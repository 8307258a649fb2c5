use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::PoolError;
use crate::factory::{KeyedPoolableFactory, PoolKey, PoolableFactory};
use crate::keyed::{KeyedPool, KeyedPooled};
use crate::pool::{Pool, Pooled};

/// Shrink schedule shared by the eroding decorators.
///
/// The interval to the next shrink contracts as the idle population
/// approaches its high-water mark: a fully idle pool becomes eligible after
/// one minute, an empty one after fifteen (both scaled by the configured
/// factor).
struct ErodingFactor {
    factor: f32,
    next_shrink: Instant,
    idle_high_water_mark: usize,
}

impl ErodingFactor {
    fn new(factor: f32) -> Self {
        ErodingFactor {
            factor,
            next_shrink: Instant::now() + Duration::from_secs_f32(900.0 * factor),
            idle_high_water_mark: 1,
        }
    }

    fn update(&mut self, now: Instant, num_idle: usize) {
        self.idle_high_water_mark = self.idle_high_water_mark.max(num_idle).max(1);
        let minutes = 15.0 + (1.0 - 15.0) / self.idle_high_water_mark as f32 * num_idle as f32;
        self.next_shrink = now + Duration::from_secs_f32(minutes * 60.0 * self.factor);
    }

    fn should_shrink(&self, now: Instant) -> bool {
        now >= self.next_shrink
    }
}

/// Decorates a [`Pool`] so that returns under declining demand invalidate
/// the instance instead of parking it idle, letting the idle set erode.
pub struct ErodingPool<M: PoolableFactory> {
    pool: Pool<M>,
    factor: Mutex<ErodingFactor>,
}

impl<M: PoolableFactory> ErodingPool<M> {
    /// Wraps `pool` with the given erosion factor.
    ///
    /// Factors below 1.0 shrink more aggressively, above 1.0 more slowly.
    ///
    /// # Panics
    ///
    /// Panics if `factor` is not positive.
    pub fn new(pool: Pool<M>, factor: f32) -> Self {
        assert!(factor > 0.0, "erosion factor must be positive");
        ErodingPool {
            pool,
            factor: Mutex::new(ErodingFactor::new(factor)),
        }
    }

    /// Borrows an instance from the wrapped pool.
    pub async fn borrow(&self) -> Result<Pooled<M>, PoolError<M::Error>> {
        self.pool.borrow().await
    }

    /// Borrows with an explicit wait bound.
    pub async fn borrow_timeout(
        &self,
        max_wait: Option<Duration>,
    ) -> Result<Pooled<M>, PoolError<M::Error>> {
        self.pool.borrow_timeout(max_wait).await
    }

    /// Returns an instance, invalidating it instead when the shrink schedule
    /// has come due and the pool holds idle instances.
    pub async fn return_object(&self, guard: Pooled<M>) -> Result<(), PoolError<M::Error>> {
        let discard = {
            let mut factor = self.factor.lock().unwrap();
            let now = Instant::now();
            if factor.should_shrink(now) {
                let num_idle = self.pool.num_idle();
                let discard = num_idle > 0;
                factor.update(now, num_idle);
                discard
            } else {
                false
            }
        };
        if discard {
            debug!("eroding return, invalidating instance");
            self.pool.invalidate_object(guard).await
        } else {
            self.pool.return_object(guard).await
        }
    }

    /// Destroys a borrowed instance.
    pub async fn invalidate_object(&self, guard: Pooled<M>) -> Result<(), PoolError<M::Error>> {
        self.pool.invalidate_object(guard).await
    }

    /// Closes the wrapped pool.
    pub async fn close(&self) {
        self.pool.close().await
    }

    /// Instances currently idle in the wrapped pool.
    pub fn num_idle(&self) -> usize {
        self.pool.num_idle()
    }

    /// Instances currently borrowed from the wrapped pool.
    pub fn num_active(&self) -> usize {
        self.pool.num_active()
    }

    /// The wrapped pool.
    pub fn inner(&self) -> &Pool<M> {
        &self.pool
    }
}

/// Per-key variant of [`ErodingPool`]: each key erodes on its own schedule.
pub struct ErodingKeyedPool<K: PoolKey, M: KeyedPoolableFactory<K>> {
    pool: KeyedPool<K, M>,
    factor: f32,
    factors: Mutex<HashMap<K, ErodingFactor>>,
}

impl<K: PoolKey, M: KeyedPoolableFactory<K>> ErodingKeyedPool<K, M> {
    /// Wraps `pool` with the given erosion factor, tracked per key.
    ///
    /// # Panics
    ///
    /// Panics if `factor` is not positive.
    pub fn new(pool: KeyedPool<K, M>, factor: f32) -> Self {
        assert!(factor > 0.0, "erosion factor must be positive");
        ErodingKeyedPool {
            pool,
            factor,
            factors: Mutex::new(HashMap::new()),
        }
    }

    /// Borrows an instance for `key` from the wrapped pool.
    pub async fn borrow(&self, key: &K) -> Result<KeyedPooled<K, M>, PoolError<M::Error>> {
        self.pool.borrow(key).await
    }

    /// Borrows with an explicit wait bound.
    pub async fn borrow_timeout(
        &self,
        key: &K,
        max_wait: Option<Duration>,
    ) -> Result<KeyedPooled<K, M>, PoolError<M::Error>> {
        self.pool.borrow_timeout(key, max_wait).await
    }

    /// Returns an instance, invalidating it instead when its key's shrink
    /// schedule has come due and that key holds idle instances.
    pub async fn return_object(
        &self,
        guard: KeyedPooled<K, M>,
    ) -> Result<(), PoolError<M::Error>> {
        let key = guard.key().clone();
        let discard = {
            let mut factors = self.factors.lock().unwrap();
            let factor = factors
                .entry(key.clone())
                .or_insert_with(|| ErodingFactor::new(self.factor));
            let now = Instant::now();
            if factor.should_shrink(now) {
                let num_idle = self.pool.num_idle_key(&key);
                let discard = num_idle > 0;
                factor.update(now, num_idle);
                discard
            } else {
                false
            }
        };
        if discard {
            debug!(key = ?key, "eroding return, invalidating instance");
            self.pool.invalidate_object(guard).await
        } else {
            self.pool.return_object(guard).await
        }
    }

    /// Destroys a borrowed instance.
    pub async fn invalidate_object(
        &self,
        guard: KeyedPooled<K, M>,
    ) -> Result<(), PoolError<M::Error>> {
        self.pool.invalidate_object(guard).await
    }

    /// Closes the wrapped pool.
    pub async fn close(&self) {
        self.pool.close().await
    }

    /// The wrapped pool.
    pub fn inner(&self) -> &KeyedPool<K, M> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::DestroyReason;
    use async_trait::async_trait;
    use std::fmt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("eroding test factory error")
        }
    }

    impl std::error::Error for TestError {}

    struct TestFactory {
        made: AtomicU64,
        destroyed: Arc<AtomicU64>,
    }

    impl TestFactory {
        fn new() -> (TestFactory, Arc<AtomicU64>) {
            let destroyed = Arc::new(AtomicU64::new(0));
            (
                TestFactory {
                    made: AtomicU64::new(0),
                    destroyed: Arc::clone(&destroyed),
                },
                destroyed,
            )
        }
    }

    #[async_trait]
    impl PoolableFactory for TestFactory {
        type Object = u64;
        type Error = TestError;

        async fn make(&self) -> Result<u64, TestError> {
            Ok(self.made.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn destroy(&self, _obj: u64, _reason: DestroyReason) -> Result<(), TestError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl KeyedPoolableFactory<String> for TestFactory {
        type Object = u64;
        type Error = TestError;

        async fn make(&self, _key: &String) -> Result<u64, TestError> {
            Ok(self.made.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn destroy(
            &self,
            _key: &String,
            _obj: u64,
            _reason: DestroyReason,
        ) -> Result<(), TestError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn shrink_interval_contracts_with_idle_pressure() {
        let mut factor = ErodingFactor::new(1.0);
        let now = Instant::now();

        // Idle at the high-water mark: one minute out.
        factor.update(now, 10);
        factor.update(now, 10);
        let interval = factor.next_shrink - now;
        assert!(interval >= Duration::from_secs(55) && interval <= Duration::from_secs(65));

        // Nothing idle: a full fifteen minutes out.
        factor.update(now, 0);
        let interval = factor.next_shrink - now;
        assert!(interval >= Duration::from_secs(14 * 60));
    }

    #[test]
    fn small_factors_shrink_sooner() {
        let aggressive = ErodingFactor::new(0.001);
        let relaxed = ErodingFactor::new(10.0);
        assert!(aggressive.next_shrink < relaxed.next_shrink);
    }

    #[tokio::test]
    async fn due_returns_are_invalidated_while_idle_remains() {
        let (factory, destroyed) = TestFactory::new();
        let pool = Pool::builder().max_total(4).build(factory);
        // 900s * 0.0001 = 90ms until the first shrink window opens.
        let eroding = ErodingPool::new(pool, 0.0001);

        let first = eroding.borrow().await.unwrap();
        let second = eroding.borrow().await.unwrap();
        eroding.return_object(first).await.unwrap();
        assert_eq!(eroding.num_idle(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        eroding.return_object(second).await.unwrap();

        assert_eq!(eroding.num_idle(), 1, "due return must be discarded");
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn returns_before_the_schedule_are_kept() {
        let (factory, destroyed) = TestFactory::new();
        let pool = Pool::builder().max_total(4).build(factory);
        let eroding = ErodingPool::new(pool, 100.0);

        let guard = eroding.borrow().await.unwrap();
        eroding.return_object(guard).await.unwrap();

        assert_eq!(eroding.num_idle(), 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn keyed_erosion_tracks_each_key_separately() {
        let (factory, destroyed) = TestFactory::new();
        let pool = KeyedPool::builder().build(factory);
        let eroding = ErodingKeyedPool::new(pool, 0.0001);

        let hot_first = eroding.borrow(&"hot".to_owned()).await.unwrap();
        let hot_second = eroding.borrow(&"hot".to_owned()).await.unwrap();
        // Seeds the "hot" key's tracker; kept, the schedule is not yet due.
        eroding.return_object(hot_first).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        // A key first returned after the sleep starts a fresh schedule and
        // keeps its instance.
        let cold = eroding.borrow(&"cold".to_owned()).await.unwrap();
        eroding.return_object(cold).await.unwrap();
        assert_eq!(eroding.inner().num_idle_key(&"cold".to_owned()), 1);

        // The "hot" schedule has come due; this return is discarded.
        eroding.return_object(hot_second).await.unwrap();
        assert_eq!(eroding.inner().num_idle_key(&"hot".to_owned()), 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }
}
