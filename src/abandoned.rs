use std::backtrace::Backtrace;
use std::time::Duration;

/// Configuration of the abandoned-object tracker.
///
/// An instance is considered abandoned when it has been borrowed and then
/// gone unused for longer than [`timeout`](AbandonedConfig::timeout). The
/// tracker reclaims the pool capacity such instances occupy; the instance
/// itself is destroyed with the `Abandoned` reason once the straggling
/// borrower finally releases it.
#[derive(Clone, Debug)]
pub struct AbandonedConfig {
    /// Sweep during borrow when the pool is close to exhaustion.
    pub remove_on_borrow: bool,
    /// Sweep during every maintenance run.
    pub remove_on_maintenance: bool,
    /// How long an instance may go unused before it counts as abandoned.
    pub timeout: Duration,
    /// Capture and log the borrow call site of reclaimed instances.
    pub log_abandoned: bool,
    /// Force a full backtrace capture even when backtraces are disabled by
    /// the environment.
    pub require_full_stack_trace: bool,
    /// Refresh the entry's last-use record on every mutable access through
    /// the borrow guard.
    pub use_usage_tracking: bool,
}

impl Default for AbandonedConfig {
    fn default() -> Self {
        AbandonedConfig {
            remove_on_borrow: false,
            remove_on_maintenance: false,
            timeout: Duration::from_secs(300),
            log_abandoned: false,
            require_full_stack_trace: false,
            use_usage_tracking: false,
        }
    }
}

impl AbandonedConfig {
    pub(crate) fn capture_call_site(&self) -> String {
        capture_call_site(self.require_full_stack_trace)
    }
}

pub(crate) fn capture_call_site(force: bool) -> String {
    let trace = if force {
        Backtrace::force_capture()
    } else {
        Backtrace::capture()
    };
    trace.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_is_five_minutes() {
        let config = AbandonedConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert!(!config.remove_on_borrow);
        assert!(!config.remove_on_maintenance);
    }

    #[test]
    fn forced_capture_is_never_empty() {
        let config = AbandonedConfig {
            require_full_stack_trace: true,
            ..AbandonedConfig::default()
        };
        assert!(!config.capture_call_site().is_empty());
    }
}
