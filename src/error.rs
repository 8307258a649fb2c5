use std::error::Error as StdError;
use std::fmt;

/// The factory operation that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FactoryPhase {
    Make,
    Activate,
    Validate,
    Passivate,
    Destroy,
}

impl fmt::Display for FactoryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FactoryPhase::Make => "make",
            FactoryPhase::Activate => "activate",
            FactoryPhase::Validate => "validate",
            FactoryPhase::Passivate => "passivate",
            FactoryPhase::Destroy => "destroy",
        })
    }
}

/// Errors surfaced by pool operations.
///
/// `E` is the error type of the pool's factory.
#[derive(Debug)]
#[non_exhaustive]
pub enum PoolError<E> {
    /// The operation was invoked after [`close`](crate::Pool::close).
    Closed,
    /// A non-blocking borrow found no capacity, or a blocking borrow timed
    /// out before an instance became available.
    Exhausted,
    /// A blocking borrow was woken by a cancellation signal before an
    /// instance became available.
    Interrupted,
    /// The instance is not managed by this pool.
    Foreign,
    /// The instance has already been returned to the pool.
    DoubleReturn,
    /// The factory failed during the named lifecycle phase.
    Factory {
        /// The phase that failed.
        phase: FactoryPhase,
        /// The factory's own error.
        source: E,
    },
}

impl<E: fmt::Display> fmt::Display for PoolError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Closed => f.write_str("pool is closed"),
            PoolError::Exhausted => f.write_str("pool exhausted"),
            PoolError::Interrupted => f.write_str("borrow was interrupted"),
            PoolError::Foreign => f.write_str("object is not managed by this pool"),
            PoolError::DoubleReturn => f.write_str("object was already returned"),
            PoolError::Factory { phase, source } => {
                write!(f, "factory failed during {phase}: {source}")
            }
        }
    }
}

impl<E: StdError + 'static> StdError for PoolError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            PoolError::Factory { source, .. } => Some(source),
            _ => None,
        }
    }
}
