use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_channel::oneshot;
use tracing::trace;

use crate::entry::PooledEntry;

/// A suspended borrower was cancelled before an entry arrived, either by the
/// pool closing or by an explicit interrupt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Interrupted;

/// The idle-object channel: an ordered deque of entries plus a FIFO queue of
/// suspended borrowers.
///
/// Offering an entry first tries to hand it directly to the longest-waiting
/// live taker, transferring ownership without touching the deque; only when
/// no taker is waiting does the entry land at the requested end. An idle
/// entry satisfies any waiter, so both ends feed the same taker queue.
pub(crate) struct IdleDeque<T> {
    inner: Arc<Mutex<DequeState<T>>>,
}

struct DequeState<T> {
    entries: VecDeque<Arc<PooledEntry<T>>>,
    takers: VecDeque<oneshot::Sender<Handoff<T>>>,
}

/// Envelope carrying a handed-off entry to a waiting borrower.
///
/// If the borrow future is dropped after the handoff was sent but before it
/// was received, dropping the envelope re-offers the entry so it is never
/// stranded outside both the deque and a borrower.
pub(crate) struct Handoff<T> {
    entry: Option<Arc<PooledEntry<T>>>,
    deque: Weak<Mutex<DequeState<T>>>,
}

impl<T> Handoff<T> {
    fn claim(mut self) -> Arc<PooledEntry<T>> {
        self.entry.take().expect("handoff already claimed")
    }
}

impl<T> Drop for Handoff<T> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            trace!("handoff abandoned by receiver, re-offering entry");
            if let Some(inner) = self.deque.upgrade() {
                if let Ok(mut state) = inner.lock() {
                    let weak = Weak::clone(&self.deque);
                    state.offer(entry, true, &weak);
                }
            }
        }
    }
}

impl<T> DequeState<T> {
    fn offer(
        &mut self,
        mut entry: Arc<PooledEntry<T>>,
        front: bool,
        weak: &Weak<Mutex<DequeState<T>>>,
    ) {
        while let Some(tx) = self.takers.pop_front() {
            if tx.is_canceled() {
                trace!("removing canceled taker");
                continue;
            }
            match tx.send(Handoff {
                entry: Some(entry),
                deque: Weak::clone(weak),
            }) {
                Ok(()) => return,
                // Receiver vanished between the cancellation check and the
                // send; recover the entry and keep looking.
                Err(handoff) => entry = handoff.claim(),
            }
        }
        if front {
            self.entries.push_front(entry);
        } else {
            self.entries.push_back(entry);
        }
    }
}

impl<T> IdleDeque<T> {
    pub(crate) fn new() -> Self {
        IdleDeque {
            inner: Arc::new(Mutex::new(DequeState {
                entries: VecDeque::new(),
                takers: VecDeque::new(),
            })),
        }
    }

    /// Offers an entry at the head, preferring a direct taker handoff.
    pub(crate) fn offer_first(&self, entry: Arc<PooledEntry<T>>) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.lock().unwrap().offer(entry, true, &weak);
    }

    /// Offers an entry at the tail, preferring a direct taker handoff.
    pub(crate) fn offer_last(&self, entry: Arc<PooledEntry<T>>) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.lock().unwrap().offer(entry, false, &weak);
    }

    /// Non-blocking poll from the head.
    pub(crate) fn try_poll_first(&self) -> Option<Arc<PooledEntry<T>>> {
        self.inner.lock().unwrap().entries.pop_front()
    }

    /// Non-blocking poll of the oldest entry given the deque's polarity.
    pub(crate) fn try_poll_oldest(&self, lifo: bool) -> Option<Arc<PooledEntry<T>>> {
        let mut state = self.inner.lock().unwrap();
        if lifo {
            state.entries.pop_back()
        } else {
            state.entries.pop_front()
        }
    }

    /// Polls the head, suspending up to `wait` (forever when `None`) for a
    /// handoff. `Ok(None)` is the timeout signal; `Err(Interrupted)` means
    /// the taker was cancelled while suspended.
    pub(crate) async fn poll_first(
        &self,
        wait: Option<Duration>,
    ) -> Result<Option<Arc<PooledEntry<T>>>, Interrupted> {
        let rx = {
            let mut state = self.inner.lock().unwrap();
            if let Some(entry) = state.entries.pop_front() {
                return Ok(Some(entry));
            }
            let (tx, rx) = oneshot::channel();
            state.takers.push_back(tx);
            rx
        };

        let received = match wait {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    self.clean_takers();
                    return Ok(None);
                }
            },
            None => rx.await,
        };

        match received {
            Ok(handoff) => Ok(Some(handoff.claim())),
            Err(oneshot::Canceled) => Err(Interrupted),
        }
    }

    /// Removes a specific entry, if present. Used when an entry is destroyed
    /// while sitting idle.
    pub(crate) fn remove(&self, entry: &Arc<PooledEntry<T>>) -> bool {
        let mut state = self.inner.lock().unwrap();
        let before = state.entries.len();
        state.entries.retain(|candidate| !Arc::ptr_eq(candidate, entry));
        state.entries.len() != before
    }

    /// Head-to-tail snapshot of the current entries. The eviction walk works
    /// over a snapshot so concurrent borrows and returns cannot invalidate
    /// its cursor.
    pub(crate) fn snapshot(&self) -> Vec<Arc<PooledEntry<T>>> {
        self.inner.lock().unwrap().entries.iter().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub(crate) fn has_takers(&self) -> bool {
        self.taker_count() > 0
    }

    pub(crate) fn taker_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .takers
            .iter()
            .filter(|taker| !taker.is_canceled())
            .count()
    }

    /// Drops takers whose borrow futures have gone away.
    pub(crate) fn clean_takers(&self) {
        self.inner
            .lock()
            .unwrap()
            .takers
            .retain(|taker| !taker.is_canceled());
    }

    /// Wakes every suspended borrower with a cancellation signal.
    pub(crate) fn interrupt_takers(&self) {
        let takers: Vec<_> = {
            let mut state = self.inner.lock().unwrap();
            state.takers.drain(..).collect()
        };
        // Dropping the senders outside the lock delivers the cancellation.
        drop(takers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> Arc<PooledEntry<u64>> {
        Arc::new(PooledEntry::new(id, id))
    }

    #[tokio::test]
    async fn offer_first_is_lifo_for_pollers() {
        let deque = IdleDeque::new();
        deque.offer_first(entry(1));
        deque.offer_first(entry(2));
        assert_eq!(deque.try_poll_first().unwrap().id(), 2);
        assert_eq!(deque.try_poll_first().unwrap().id(), 1);
        assert!(deque.try_poll_first().is_none());
    }

    #[tokio::test]
    async fn offer_last_is_fifo_for_pollers() {
        let deque = IdleDeque::new();
        deque.offer_last(entry(1));
        deque.offer_last(entry(2));
        assert_eq!(deque.try_poll_first().unwrap().id(), 1);
        assert_eq!(deque.try_poll_first().unwrap().id(), 2);
    }

    #[tokio::test]
    async fn oldest_depends_on_polarity() {
        let deque = IdleDeque::new();
        deque.offer_first(entry(1));
        deque.offer_first(entry(2));
        assert_eq!(deque.try_poll_oldest(true).unwrap().id(), 1);

        let deque = IdleDeque::new();
        deque.offer_last(entry(1));
        deque.offer_last(entry(2));
        assert_eq!(deque.try_poll_oldest(false).unwrap().id(), 1);
    }

    #[tokio::test]
    async fn poll_times_out_with_no_element() {
        let deque: IdleDeque<u64> = IdleDeque::new();
        let polled = deque.poll_first(Some(Duration::from_millis(10))).await;
        assert_eq!(polled.expect("timeout is not an interrupt").map(|_| ()), None);
        assert_eq!(deque.taker_count(), 0);
    }

    #[tokio::test]
    async fn poll_pends_until_an_offer_arrives() {
        use tokio_test::{assert_pending, assert_ready};

        let deque: Arc<IdleDeque<u64>> = Arc::new(IdleDeque::new());
        let mut poll = tokio_test::task::spawn(deque.poll_first(None));
        assert_pending!(poll.poll());
        assert_eq!(deque.taker_count(), 1);

        deque.offer_first(entry(3));
        assert!(poll.is_woken());
        let polled = assert_ready!(poll.poll());
        assert_eq!(polled.unwrap().unwrap().id(), 3);
    }

    #[tokio::test]
    async fn offer_unparks_a_concurrent_poll() {
        use futures_util::future::join;

        let deque = Arc::new(IdleDeque::new());
        let (polled, ()) = join(deque.poll_first(None), async {
            // The poll future parks first; this arm then offers, which must
            // unpark it with the entry.
            tokio::task::yield_now().await;
            deque.offer_last(entry(7));
        })
        .await;
        assert_eq!(polled.unwrap().unwrap().id(), 7);
    }

    #[tokio::test]
    async fn offer_hands_off_to_suspended_taker() {
        let deque = Arc::new(IdleDeque::new());
        let waiter = {
            let deque = Arc::clone(&deque);
            tokio::spawn(async move { deque.poll_first(None).await })
        };
        tokio::task::yield_now().await;
        assert!(deque.has_takers());

        deque.offer_first(entry(9));
        let got = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(got.id(), 9);
        // A direct handoff must bypass the deque entirely.
        assert_eq!(deque.len(), 0);
    }

    #[tokio::test]
    async fn takers_are_served_in_enrollment_order() {
        let deque: Arc<IdleDeque<u64>> = Arc::new(IdleDeque::new());
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let deque = Arc::clone(&deque);
            waiters.push(tokio::spawn(async move { deque.poll_first(None).await }));
            tokio::task::yield_now().await;
        }
        assert_eq!(deque.taker_count(), 3);

        for id in [10, 11, 12] {
            deque.offer_last(entry(id));
        }
        for (expected, waiter) in [10, 11, 12].into_iter().zip(waiters) {
            let got = waiter.await.unwrap().unwrap().unwrap();
            assert_eq!(got.id(), expected);
        }
    }

    #[tokio::test]
    async fn interrupt_wakes_taker_with_cancellation() {
        let deque: Arc<IdleDeque<u64>> = Arc::new(IdleDeque::new());
        let waiter = {
            let deque = Arc::clone(&deque);
            tokio::spawn(async move { deque.poll_first(None).await })
        };
        tokio::task::yield_now().await;

        deque.interrupt_takers();
        assert!(matches!(waiter.await.unwrap(), Err(Interrupted)));
    }

    #[tokio::test]
    async fn canceled_taker_does_not_consume_an_offer() {
        let deque: Arc<IdleDeque<u64>> = Arc::new(IdleDeque::new());
        let waiter = {
            let deque = Arc::clone(&deque);
            tokio::spawn(async move { deque.poll_first(None).await })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        deque.offer_first(entry(4));
        assert_eq!(deque.len(), 1);
        assert_eq!(deque.taker_count(), 0);
    }
}
