use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::policy::EvictionCandidate;

/// Lifecycle state of one pooled entry.
///
/// Transitions are serialized under the entry's own lock; every entry is in
/// exactly one state at any moment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryState {
    /// Parked in the idle set, available for borrowing.
    Idle,
    /// Checked out by a borrower.
    Allocated,
    /// Under examination by the evictor.
    Eviction,
    /// A borrower tried to allocate the entry mid-eviction-test; the evictor
    /// must re-insert it at the head of the idle deque when the test ends.
    EvictionReturnToHead,
    /// A borrower is running the factory's validation on it.
    Validation,
    /// Terminal: the entry is being destroyed.
    Invalid,
    /// Terminal: reclaimed by the abandoned-object tracker.
    Abandoned,
    /// In flight between a borrower and the idle set.
    Returning,
}

#[derive(Debug)]
struct EntryInner<T> {
    state: EntryState,
    /// The instance parks here whenever the borrower or evictor does not own
    /// it.
    obj: Option<T>,
    last_borrow: Instant,
    last_use: Instant,
    last_return: Instant,
    borrow_count: u64,
    borrowed_by: Option<String>,
    used_by: Option<String>,
}

/// What the evictor must do with an entry once its test ends.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EvictionTestEnd<T> {
    /// The entry never left the idle deque.
    InPlace,
    /// A borrower removed it mid-test; re-offer at the head.
    ReturnToHead,
    /// The entry was invalidated mid-test (pool close or clear); the caller
    /// must destroy the instance.
    Dead(T),
}

/// Internal wrapper tracking state and timestamps for one instance.
///
/// The instance itself moves in and out of the entry as ownership changes
/// hands: `allocate` moves it to the borrower, `deallocate` moves it back,
/// and the eviction test borrows it for the duration of the factory calls.
#[derive(Debug)]
pub(crate) struct PooledEntry<T> {
    id: u64,
    created: Instant,
    inner: Mutex<EntryInner<T>>,
}

impl<T> PooledEntry<T> {
    pub(crate) fn new(id: u64, obj: T) -> Self {
        let now = Instant::now();
        PooledEntry {
            id,
            created: now,
            inner: Mutex::new(EntryInner {
                state: EntryState::Idle,
                obj: Some(obj),
                last_borrow: now,
                last_use: now,
                last_return: now,
                borrow_count: 0,
                borrowed_by: None,
                used_by: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> EntryState {
        self.inner.lock().unwrap().state
    }

    /// Idle → Allocated, moving the instance out to the borrower.
    ///
    /// From `Eviction` the entry is flagged for head re-insertion and `None`
    /// is returned; from any other state `None` simply tells the caller to
    /// try another entry.
    pub(crate) fn allocate(&self, borrowed_by: Option<String>) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            EntryState::Idle => {
                let obj = inner.obj.take()?;
                let now = Instant::now();
                inner.state = EntryState::Allocated;
                inner.last_borrow = now;
                inner.last_use = now;
                inner.borrow_count += 1;
                inner.borrowed_by = borrowed_by;
                Some(obj)
            }
            EntryState::Eviction => {
                inner.state = EntryState::EvictionReturnToHead;
                None
            }
            _ => None,
        }
    }

    /// Allocated → Returning. Returns `false` when the entry is not
    /// currently borrowed, which the pool reports as a double return.
    pub(crate) fn mark_returning(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == EntryState::Allocated {
            inner.state = EntryState::Returning;
            true
        } else {
            false
        }
    }

    /// Allocated/Returning → Idle, moving the instance back in.
    pub(crate) fn deallocate(&self, obj: T) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(matches!(
            inner.state,
            EntryState::Allocated | EntryState::Returning
        ));
        inner.state = EntryState::Idle;
        inner.obj = Some(obj);
        inner.last_return = Instant::now();
    }

    /// Idle → Eviction, lending the instance to the evictor for the test.
    pub(crate) fn start_eviction_test(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == EntryState::Idle {
            let obj = inner.obj.take()?;
            inner.state = EntryState::Eviction;
            Some(obj)
        } else {
            None
        }
    }

    /// Ends an eviction test, handing the instance back.
    pub(crate) fn end_eviction_test(&self, obj: T) -> EvictionTestEnd<T> {
        let mut inner = self.inner.lock().unwrap();
        let outcome = match inner.state {
            EntryState::EvictionReturnToHead => EvictionTestEnd::ReturnToHead,
            EntryState::Eviction => EvictionTestEnd::InPlace,
            // Invalidated mid-test by a concurrent clear or close; the
            // bookkeeping is already done, only the instance remains.
            _ => return EvictionTestEnd::Dead(obj),
        };
        inner.state = EntryState::Idle;
        inner.obj = Some(obj);
        outcome
    }

    /// Allocated → Validation while the borrower runs the factory's check.
    pub(crate) fn begin_validation(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == EntryState::Allocated {
            inner.state = EntryState::Validation;
        }
    }

    /// Validation → Allocated.
    pub(crate) fn end_validation(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == EntryState::Validation {
            inner.state = EntryState::Allocated;
        }
    }

    /// Any → Invalid (terminal). Returns the instance if the entry still
    /// holds it; a borrower-owned instance is destroyed by its owner.
    pub(crate) fn invalidate(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.state = EntryState::Invalid;
        inner.obj.take()
    }

    /// Allocated → Abandoned (terminal). Returns `false` if the entry was
    /// not borrowed, e.g. because it was returned concurrently.
    pub(crate) fn mark_abandoned(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == EntryState::Allocated {
            inner.state = EntryState::Abandoned;
            true
        } else {
            false
        }
    }

    /// Refreshes the last-use record; the explicit `use` notification.
    pub(crate) fn touch(&self) {
        self.inner.lock().unwrap().last_use = Instant::now();
    }

    /// Folds in a usage timestamp reported by the instance itself.
    pub(crate) fn record_use_at(&self, at: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if at > inner.last_use {
            inner.last_use = at;
        }
    }

    pub(crate) fn set_used_by(&self, trace: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.used_by = Some(trace);
        inner.last_use = Instant::now();
    }

    pub(crate) fn borrowed_by(&self) -> Option<String> {
        self.inner.lock().unwrap().borrowed_by.clone()
    }

    pub(crate) fn used_by(&self) -> Option<String> {
        self.inner.lock().unwrap().used_by.clone()
    }

    pub(crate) fn borrow_count(&self) -> u64 {
        self.inner.lock().unwrap().borrow_count
    }

    /// Time since the last return. Saturates to zero if the clock stepped
    /// backward.
    pub(crate) fn idle_duration(&self) -> Duration {
        let last_return = self.inner.lock().unwrap().last_return;
        Instant::now().saturating_duration_since(last_return)
    }

    /// Time since the current borrow began.
    pub(crate) fn active_duration(&self) -> Duration {
        let last_borrow = self.inner.lock().unwrap().last_borrow;
        Instant::now().saturating_duration_since(last_borrow)
    }

    /// Whether the entry is borrowed and unused for longer than `timeout`.
    pub(crate) fn is_abandoned_candidate(&self, now: Instant, timeout: Duration) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == EntryState::Allocated
            && now.saturating_duration_since(inner.last_use) > timeout
    }

    pub(crate) fn eviction_candidate(&self) -> EvictionCandidate {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        EvictionCandidate {
            idle: now.saturating_duration_since(inner.last_return),
            age: now.saturating_duration_since(self.created),
            borrow_count: inner.borrow_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_moves_object_and_stamps() {
        let entry = PooledEntry::new(1, "conn");
        assert_eq!(entry.state(), EntryState::Idle);

        let obj = entry.allocate(None).expect("idle entry allocates");
        assert_eq!(obj, "conn");
        assert_eq!(entry.state(), EntryState::Allocated);
        assert_eq!(entry.borrow_count(), 1);

        // A second allocate must signal "try another entry".
        assert!(entry.allocate(None).is_none());
    }

    #[test]
    fn return_cycle_restores_idle() {
        let entry = PooledEntry::new(1, 7u32);
        let obj = entry.allocate(None).unwrap();
        assert!(entry.mark_returning());
        assert!(!entry.mark_returning(), "double return must be detected");
        entry.deallocate(obj);
        assert_eq!(entry.state(), EntryState::Idle);
    }

    #[test]
    fn eviction_test_in_place() {
        let entry = PooledEntry::new(1, 7u32);
        let obj = entry.start_eviction_test().unwrap();
        assert_eq!(entry.state(), EntryState::Eviction);
        assert_eq!(entry.end_eviction_test(obj), EvictionTestEnd::InPlace);
        assert_eq!(entry.state(), EntryState::Idle);
    }

    #[test]
    fn allocate_during_eviction_flags_return_to_head() {
        let entry = PooledEntry::new(1, 7u32);
        let obj = entry.start_eviction_test().unwrap();
        assert!(entry.allocate(None).is_none());
        assert_eq!(entry.state(), EntryState::EvictionReturnToHead);
        assert_eq!(entry.end_eviction_test(obj), EvictionTestEnd::ReturnToHead);
        assert_eq!(entry.state(), EntryState::Idle);
    }

    #[test]
    fn invalidate_during_eviction_test_hands_object_back() {
        let entry = PooledEntry::new(1, 7u32);
        let obj = entry.start_eviction_test().unwrap();
        assert!(entry.invalidate().is_none(), "evictor owns the object");
        match entry.end_eviction_test(obj) {
            EvictionTestEnd::Dead(obj) => assert_eq!(obj, 7),
            other => panic!("expected Dead, got {other:?}"),
        }
        assert_eq!(entry.state(), EntryState::Invalid);
    }

    #[test]
    fn invalidate_is_terminal_and_yields_object() {
        let entry = PooledEntry::new(1, 7u32);
        assert_eq!(entry.invalidate(), Some(7));
        assert_eq!(entry.state(), EntryState::Invalid);
        assert!(entry.allocate(None).is_none());
    }

    #[test]
    fn abandoned_only_from_allocated() {
        let entry = PooledEntry::new(1, 7u32);
        assert!(!entry.mark_abandoned());
        let _obj = entry.allocate(None).unwrap();
        assert!(entry.mark_abandoned());
        assert_eq!(entry.state(), EntryState::Abandoned);
    }

    #[test]
    fn abandonment_tracks_last_use() {
        let entry = PooledEntry::new(1, 7u32);
        let _obj = entry.allocate(None).unwrap();
        let soon = Instant::now() + Duration::from_millis(50);
        assert!(entry.is_abandoned_candidate(soon, Duration::from_millis(10)));
        entry.touch();
        assert!(!entry.is_abandoned_candidate(Instant::now(), Duration::from_millis(10)));
    }
}
