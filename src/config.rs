use std::time::Duration;

/// Knobs shared by the single and keyed pool shapes.
///
/// `None` for a duration means the associated behavior is unbounded or
/// disabled, mirroring the non-positive sentinel values of classic pool
/// configurations.
#[derive(Clone, Debug)]
pub struct CommonConfig {
    /// Idle polarity: `true` hands out the most recently returned instance
    /// first, `false` the oldest.
    pub lifo: bool,
    /// Retained for configuration compatibility. Waiter handoff is always
    /// performed in enrollment order; see the crate documentation.
    pub fairness: bool,
    /// Upper bound on how long a blocking borrow waits. `None` waits forever.
    pub max_wait: Option<Duration>,
    /// Whether an exhausted borrow waits (`true`) or fails fast (`false`).
    pub block_when_exhausted: bool,
    /// Validate instances right after creation, before first handout.
    pub test_on_create: bool,
    /// Validate instances before every handout.
    pub test_on_borrow: bool,
    /// Validate instances on return, before passivation.
    pub test_on_return: bool,
    /// Validate idle instances during eviction runs.
    pub test_while_idle: bool,
    /// Cadence of the maintenance task. `None` disables it.
    pub time_between_eviction_runs: Option<Duration>,
    /// Idle instances examined per eviction run: positive caps the count,
    /// negative `-n` examines `ceil(idle / n)`, zero examines none.
    pub num_tests_per_eviction_run: i32,
    /// Hard idle threshold: idle instances older than this are always
    /// eligible for eviction.
    pub min_evictable_idle: Option<Duration>,
    /// Soft idle threshold: applies only while more than `min_idle`
    /// instances are idle.
    pub soft_min_evictable_idle: Option<Duration>,
    /// Optional name reported in the status snapshot and log events.
    pub name: Option<String>,
}

impl Default for CommonConfig {
    fn default() -> Self {
        CommonConfig {
            lifo: true,
            fairness: false,
            max_wait: None,
            block_when_exhausted: true,
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs: None,
            num_tests_per_eviction_run: 3,
            min_evictable_idle: Some(Duration::from_secs(30 * 60)),
            soft_min_evictable_idle: None,
            name: None,
        }
    }
}

/// Configuration for [`Pool`](crate::Pool).
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Shared behavior knobs.
    pub common: CommonConfig,
    /// Cap on instances managed at once, in-flight creations included.
    /// `None` is unlimited.
    pub max_total: Option<usize>,
    /// Cap on idle instances retained on return; excess is destroyed.
    /// `None` is unlimited.
    pub max_idle: Option<usize>,
    /// Floor of idle instances replenished by the maintenance task.
    pub min_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            common: CommonConfig::default(),
            max_total: Some(8),
            max_idle: Some(8),
            min_idle: 0,
        }
    }
}

/// Configuration for [`KeyedPool`](crate::KeyedPool).
#[derive(Clone, Debug)]
pub struct KeyedPoolConfig {
    /// Shared behavior knobs.
    pub common: CommonConfig,
    /// Cap on instances across all keys. `None` is unlimited.
    pub max_total: Option<usize>,
    /// Cap on instances managed per key. `None` is unlimited.
    pub max_total_per_key: Option<usize>,
    /// Cap on idle instances retained per key on return. `None` is
    /// unlimited.
    pub max_idle_per_key: Option<usize>,
    /// Idle floor replenished per key by the maintenance task.
    pub min_idle_per_key: usize,
}

impl Default for KeyedPoolConfig {
    fn default() -> Self {
        KeyedPoolConfig {
            common: CommonConfig::default(),
            max_total: None,
            max_total_per_key: Some(8),
            max_idle_per_key: Some(8),
            min_idle_per_key: 0,
        }
    }
}
