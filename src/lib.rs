//! A generic, fair, instrumented object pool for Tokio applications.
//!
//! Creating a database connection, a heavyweight parser, or a network
//! session over and over is wasteful; `corral` keeps a bounded set of live
//! instances that callers borrow, use, and return. The crate is agnostic to
//! what it pools: implementors of [`PoolableFactory`] supply the lifecycle
//! (create, activate, validate, passivate, destroy) and the pool does the
//! rest.
//!
//! Two pool shapes share a common core:
//!
//! - [`Pool`] manages a single set of interchangeable instances.
//! - [`KeyedPool`] maintains a logically separate sub-pool per key, with an
//!   optional global cap enforced across keys.
//!
//! Both offer blocking borrows with timeouts served in strict enrollment
//! order, a background evictor driven by one process-wide scheduler,
//! abandoned-object reclamation, and a status snapshot of counters and
//! rolling latency means. The [`ErodingPool`] and [`ErodingKeyedPool`]
//! decorators additionally shrink idle capacity as demand declines.
//!
//! # Example
//!
//! ```
//! use async_trait::async_trait;
//! use corral::{DestroyReason, Pool, PoolableFactory};
//!
//! /// Pools reusable scratch buffers.
//! struct Buffers;
//!
//! #[async_trait]
//! impl PoolableFactory for Buffers {
//!     type Object = Vec<u8>;
//!     type Error = std::io::Error;
//!
//!     async fn make(&self) -> Result<Vec<u8>, Self::Error> {
//!         Ok(Vec::with_capacity(64 * 1024))
//!     }
//!
//!     async fn destroy(&self, _obj: Vec<u8>, _reason: DestroyReason) -> Result<(), Self::Error> {
//!         Ok(())
//!     }
//!
//!     async fn passivate(&self, obj: &mut Vec<u8>) -> Result<(), Self::Error> {
//!         obj.clear();
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = Pool::builder().max_total(4).build(Buffers);
//!
//! let mut buffer = pool.borrow().await.unwrap();
//! buffer.extend_from_slice(b"scratch space");
//!
//! // Returning explicitly surfaces lifecycle errors; dropping the guard
//! // returns in the background instead.
//! pool.return_object(buffer).await.unwrap();
//! assert_eq!(pool.status().num_idle, 1);
//! # }
//! ```

mod abandoned;
mod config;
mod deque;
mod entry;
mod error;
mod eroding;
pub mod evictor;
mod factory;
mod keyed;
mod policy;
mod pool;
mod stats;

pub use crate::abandoned::AbandonedConfig;
pub use crate::config::{CommonConfig, KeyedPoolConfig, PoolConfig};
pub use crate::error::{FactoryPhase, PoolError};
pub use crate::eroding::{ErodingKeyedPool, ErodingPool};
pub use crate::factory::{
    DestroyReason, KeyedPoolableFactory, PoolKey, PoolableFactory, TrackedUse,
};
pub use crate::keyed::{KeyedPool, KeyedPoolBuilder, KeyedPooled};
pub use crate::policy::{
    lookup_policy, register_policy, DefaultEvictionPolicy, EvictionCandidate, EvictionConfig,
    EvictionPolicy, EvictionPolicyChoice,
};
pub use crate::pool::{Pool, PoolBuilder, Pooled};
pub use crate::stats::PoolStatus;
