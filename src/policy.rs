use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

/// Thresholds consulted by an [`EvictionPolicy`].
#[derive(Clone, Debug)]
pub struct EvictionConfig {
    /// Hard idle threshold. `None` never evicts on age alone.
    pub idle_evict_time: Option<Duration>,
    /// Soft idle threshold, honored only above the `min_idle` floor.
    pub idle_soft_evict_time: Option<Duration>,
    /// Idle floor protected from soft eviction.
    pub min_idle: usize,
}

/// A read-only snapshot of the idle entry under test.
#[derive(Clone, Copy, Debug)]
pub struct EvictionCandidate {
    /// How long the entry has been idle.
    pub idle: Duration,
    /// How long ago the entry was created.
    pub age: Duration,
    /// How many times the entry has been borrowed.
    pub borrow_count: u64,
}

/// Decides whether an idle entry should be destroyed during a maintenance
/// run.
///
/// Implementations must be pure decision functions: the pool calls them with
/// its locks released and expects no side effects.
pub trait EvictionPolicy: Send + Sync + 'static {
    /// Returns `true` if the candidate should be evicted.
    fn evict(
        &self,
        config: &EvictionConfig,
        candidate: &EvictionCandidate,
        idle_count: usize,
    ) -> bool;
}

/// The stock policy: evict past the hard threshold, or past the soft
/// threshold while more than `min_idle` entries are idle.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultEvictionPolicy;

impl EvictionPolicy for DefaultEvictionPolicy {
    fn evict(
        &self,
        config: &EvictionConfig,
        candidate: &EvictionCandidate,
        idle_count: usize,
    ) -> bool {
        let hard = config
            .idle_evict_time
            .map_or(false, |limit| candidate.idle > limit);
        let soft = config
            .idle_soft_evict_time
            .map_or(false, |limit| candidate.idle > limit)
            && idle_count > config.min_idle;
        hard || soft
    }
}

/// How a pool selects its eviction policy.
#[derive(Clone, Default)]
pub enum EvictionPolicyChoice {
    /// Use [`DefaultEvictionPolicy`].
    #[default]
    Default,
    /// Look the policy up in the process-wide registry at build time.
    Named(String),
    /// Use the supplied policy directly.
    Custom(Arc<dyn EvictionPolicy>),
}

impl std::fmt::Debug for EvictionPolicyChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionPolicyChoice::Default => f.write_str("Default"),
            EvictionPolicyChoice::Named(name) => f.debug_tuple("Named").field(name).finish(),
            EvictionPolicyChoice::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl EvictionPolicyChoice {
    pub(crate) fn resolve(&self) -> Arc<dyn EvictionPolicy> {
        match self {
            EvictionPolicyChoice::Default => Arc::new(DefaultEvictionPolicy),
            EvictionPolicyChoice::Custom(policy) => policy.clone(),
            EvictionPolicyChoice::Named(name) => lookup_policy(name).unwrap_or_else(|| {
                tracing::warn!(policy = %name, "unknown eviction policy, using default");
                Arc::new(DefaultEvictionPolicy)
            }),
        }
    }
}

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn EvictionPolicy>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<dyn EvictionPolicy>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn EvictionPolicy>> = HashMap::new();
        map.insert("default".to_owned(), Arc::new(DefaultEvictionPolicy));
        RwLock::new(map)
    })
}

/// Registers a policy under `name` for selection via
/// [`EvictionPolicyChoice::Named`]. Re-registering a name replaces the
/// previous policy for pools built afterwards.
pub fn register_policy(name: impl Into<String>, policy: Arc<dyn EvictionPolicy>) {
    registry()
        .write()
        .expect("policy registry poisoned")
        .insert(name.into(), policy);
}

/// Looks up a previously registered policy.
pub fn lookup_policy(name: &str) -> Option<Arc<dyn EvictionPolicy>> {
    registry()
        .read()
        .expect("policy registry poisoned")
        .get(name)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(idle_secs: u64) -> EvictionCandidate {
        EvictionCandidate {
            idle: Duration::from_secs(idle_secs),
            age: Duration::from_secs(idle_secs),
            borrow_count: 0,
        }
    }

    #[test]
    fn hard_threshold_ignores_idle_count() {
        let config = EvictionConfig {
            idle_evict_time: Some(Duration::from_secs(60)),
            idle_soft_evict_time: None,
            min_idle: 10,
        };
        assert!(DefaultEvictionPolicy.evict(&config, &candidate(61), 1));
        assert!(!DefaultEvictionPolicy.evict(&config, &candidate(59), 1));
    }

    #[test]
    fn soft_threshold_respects_min_idle_floor() {
        let config = EvictionConfig {
            idle_evict_time: None,
            idle_soft_evict_time: Some(Duration::from_secs(10)),
            min_idle: 2,
        };
        assert!(DefaultEvictionPolicy.evict(&config, &candidate(11), 3));
        assert!(!DefaultEvictionPolicy.evict(&config, &candidate(11), 2));
    }

    #[test]
    fn disabled_thresholds_never_evict() {
        let config = EvictionConfig {
            idle_evict_time: None,
            idle_soft_evict_time: None,
            min_idle: 0,
        };
        assert!(!DefaultEvictionPolicy.evict(&config, &candidate(u64::MAX / 2), 100));
    }

    #[test]
    fn registry_round_trip() {
        register_policy("aggressive", Arc::new(DefaultEvictionPolicy));
        assert!(lookup_policy("aggressive").is_some());
        assert!(lookup_policy("no-such-policy").is_none());
        assert!(lookup_policy("default").is_some());
    }
}
