use std::error::Error as StdError;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Instant;

use async_trait::async_trait;

/// Why an instance is being destroyed.
///
/// Passed to [`PoolableFactory::destroy`] so a factory can distinguish a
/// routine teardown from the reclamation of an abandoned instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DestroyReason {
    /// Ordinary lifecycle destruction (eviction, invalidation, shutdown).
    #[default]
    Normal,
    /// The instance was reclaimed by the abandoned-object tracker.
    Abandoned,
}

/// The lifecycle supplier for a [`Pool`](crate::Pool).
///
/// The pool calls `make` to produce instances, `activate`/`passivate` when an
/// instance crosses the idle boundary, `validate` when configured to test
/// instances, and `destroy` when an instance leaves the pool for good. None
/// of these are invoked while the pool holds any of its internal locks, so a
/// factory may freely call back into the pool or block on external resources.
#[async_trait]
pub trait PoolableFactory: Send + Sync + 'static {
    /// The instance type this factory produces.
    type Object: Send + 'static;
    /// The error type returned by lifecycle operations.
    type Error: StdError + Send + 'static;

    /// Creates a new instance.
    async fn make(&self) -> Result<Self::Object, Self::Error>;

    /// Destroys an instance. Failures are swallowed and counted by the pool.
    async fn destroy(&self, obj: Self::Object, reason: DestroyReason) -> Result<(), Self::Error>;

    /// Checks whether an instance is still usable.
    async fn validate(&self, _obj: &mut Self::Object) -> bool {
        true
    }

    /// Reinitializes an instance before it is handed to a borrower.
    async fn activate(&self, _obj: &mut Self::Object) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Quiesces an instance before it is parked in the idle set.
    async fn passivate(&self, _obj: &mut Self::Object) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// The lifecycle supplier for a [`KeyedPool`](crate::KeyedPool).
///
/// Identical to [`PoolableFactory`] except that every operation receives the
/// key of the sub-pool the instance belongs to.
#[async_trait]
pub trait KeyedPoolableFactory<K: PoolKey>: Send + Sync + 'static {
    /// The instance type this factory produces.
    type Object: Send + 'static;
    /// The error type returned by lifecycle operations.
    type Error: StdError + Send + 'static;

    /// Creates a new instance for `key`.
    async fn make(&self, key: &K) -> Result<Self::Object, Self::Error>;

    /// Destroys an instance belonging to `key`.
    async fn destroy(
        &self,
        key: &K,
        obj: Self::Object,
        reason: DestroyReason,
    ) -> Result<(), Self::Error>;

    /// Checks whether an instance belonging to `key` is still usable.
    async fn validate(&self, _key: &K, _obj: &mut Self::Object) -> bool {
        true
    }

    /// Reinitializes an instance before it is handed to a borrower.
    async fn activate(&self, _key: &K, _obj: &mut Self::Object) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Quiesces an instance before it is parked in the idle set.
    async fn passivate(&self, _key: &K, _obj: &mut Self::Object) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Bounds required of a keyed pool's key type.
pub trait PoolKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> PoolKey for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// An optional capability for instances that track their own usage.
///
/// When a pool with usage tracking enabled computes how long an instance has
/// gone unused, it takes the later of its own record and this value.
pub trait TrackedUse {
    /// The instant the instance itself was last used.
    fn last_used(&self) -> Instant;
}
