//! Transaction completion tracking
//!
//! A tracker counts Start and End markers per transaction id. A transaction
//! completes once both counts reach the number of channels feeding the
//! tracker, so a fan-in consumer over N channels only resolves after every
//! producer has finished. Outcomes are kept, so waiters arriving after
//! completion resolve immediately. With no channels at all every
//! transaction is complete as soon as it is asked about.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

use super::protocol::{Transaction, TransactionId, TransactionState};
use crate::error::{ShardError, ShardResult};

#[derive(Default)]
struct Progress {
    starts: usize,
    ends: usize,
    outcome: Option<ShardResult<()>>,
    waiters: Vec<oneshot::Sender<ShardResult<()>>>,
}

impl Progress {
    fn resolve(&mut self, outcome: ShardResult<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
        self.outcome = Some(outcome);
    }
}

#[derive(Default)]
struct TrackerState {
    transactions: HashMap<TransactionId, Progress>,
    completed_channels: usize,
    closed: Option<ShardError>,
}

/// Counts transaction boundaries across one or more channels
pub struct TransactionTracker {
    expected: AtomicUsize,
    state: Mutex<TrackerState>,
}

impl TransactionTracker {
    /// Tracker for `expected` channels, each contributing one Start and one End
    pub fn new(expected: usize) -> Self {
        Self {
            expected: AtomicUsize::new(expected),
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected.load(Ordering::Acquire)
    }

    /// Change the number of contributing channels
    ///
    /// Transactions already started keep being counted against the new value.
    pub fn set_expected(&self, expected: usize) {
        self.expected.store(expected, Ordering::Release);
        let mut state = self.state.lock();
        for (id, progress) in state.transactions.iter_mut() {
            Self::try_complete(*id, progress, expected);
        }
    }

    pub fn record(&self, transaction: Transaction) {
        match transaction.state {
            TransactionState::Start => self.record_start(transaction.id),
            TransactionState::End => self.record_end(transaction.id),
        }
    }

    pub fn record_start(&self, id: TransactionId) {
        let expected = self.expected();
        let mut state = self.state.lock();
        let progress = state.transactions.entry(id).or_default();
        progress.starts += 1;
        tracing::trace!("Transaction {}: start {}/{}", id, progress.starts, expected);
        Self::try_complete(id, progress, expected);
    }

    pub fn record_end(&self, id: TransactionId) {
        let expected = self.expected();
        let mut state = self.state.lock();
        let progress = state.transactions.entry(id).or_default();
        progress.ends += 1;
        tracing::trace!("Transaction {}: end {}/{}", id, progress.ends, expected);
        Self::try_complete(id, progress, expected);
    }

    fn try_complete(id: TransactionId, progress: &mut Progress, expected: usize) {
        if progress.outcome.is_none() && progress.starts >= expected && progress.ends >= expected {
            progress.resolve(Ok(()));
            tracing::debug!("Transaction {} complete", id);
        }
    }

    /// Fail one transaction if it has not completed yet
    pub fn fail(&self, id: TransactionId, error: ShardError) {
        let mut state = self.state.lock();
        let progress = state.transactions.entry(id).or_default();
        if progress.outcome.is_none() {
            tracing::warn!("Transaction {} failed: {}", id, error);
            progress.resolve(Err(error));
        }
    }

    /// One contributing channel completed; closes the tracker once all have
    pub fn channel_completed(&self, error: ShardError) {
        let expected = self.expected();
        let all_done = {
            let mut state = self.state.lock();
            state.completed_channels += 1;
            state.completed_channels >= expected
        };
        if all_done {
            self.close(error);
        }
    }

    /// Fail every unfinished transaction and reject future waits on them
    pub fn close(&self, error: ShardError) {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return;
        }
        for progress in state.transactions.values_mut() {
            if progress.outcome.is_none() {
                progress.resolve(Err(error.clone()));
            }
        }
        state.closed = Some(error);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    pub fn is_complete(&self, id: TransactionId) -> bool {
        matches!(
            self.state
                .lock()
                .transactions
                .get(&id)
                .and_then(|p| p.outcome.as_ref()),
            Some(Ok(()))
        )
    }

    /// Number of waiters still parked on a transaction
    pub fn pending_waiters(&self, id: TransactionId) -> usize {
        self.state
            .lock()
            .transactions
            .get(&id)
            .map(|p| p.waiters.len())
            .unwrap_or(0)
    }

    /// Resolve once the transaction has completed (or failed)
    pub async fn wait(&self, id: TransactionId) -> ShardResult<()> {
        let expected = self.expected();
        let rx = {
            let mut state = self.state.lock();
            let closed = state.closed.clone();
            let progress = state.transactions.entry(id).or_default();
            Self::try_complete(id, progress, expected);
            if let Some(outcome) = &progress.outcome {
                return outcome.clone();
            }
            if let Some(error) = closed {
                return Err(error);
            }
            let (tx, rx) = oneshot::channel();
            progress.waiters.push(tx);
            rx
        };

        rx.await
            .map_err(|_| ShardError::Internal(format!("waiter for transaction {} dropped", id)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, assert_ready_err, assert_ready_ok, task};

    #[test]
    fn test_single_channel_completion() {
        let tracker = TransactionTracker::new(1);
        let id = TransactionId::new();

        let mut waiter = task::spawn(tracker.wait(id));
        assert_pending!(waiter.poll());

        tracker.record_start(id);
        assert_pending!(waiter.poll());

        tracker.record_end(id);
        assert!(waiter.is_woken());
        assert_ready_ok!(waiter.poll());
    }

    #[test]
    fn test_late_waiter_resolves_immediately() {
        let tracker = TransactionTracker::new(1);
        let id = TransactionId::new();
        tracker.record_start(id);
        tracker.record_end(id);

        let mut waiter = task::spawn(tracker.wait(id));
        assert_ready_ok!(waiter.poll());
        assert!(tracker.is_complete(id));
    }

    #[test]
    fn test_counts_every_channel() {
        let tracker = TransactionTracker::new(3);
        let id = TransactionId::new();
        let mut waiter = task::spawn(tracker.wait(id));

        // One producer finishing early must not resolve the transaction
        tracker.record_start(id);
        tracker.record_end(id);
        assert_pending!(waiter.poll());

        tracker.record_start(id);
        tracker.record_start(id);
        tracker.record_end(id);
        assert_pending!(waiter.poll());

        tracker.record_end(id);
        assert_ready_ok!(waiter.poll());
    }

    #[test]
    fn test_ends_without_all_starts_do_not_arm() {
        let tracker = TransactionTracker::new(2);
        let id = TransactionId::new();
        tracker.record_start(id);
        tracker.record_end(id);
        tracker.record_end(id);
        assert!(!tracker.is_complete(id));

        tracker.record_start(id);
        assert!(tracker.is_complete(id));
    }

    #[test]
    fn test_raising_expected_count() {
        let tracker = TransactionTracker::new(1);
        tracker.set_expected(2);
        let id = TransactionId::new();
        tracker.record_start(id);
        tracker.record_end(id);
        assert!(!tracker.is_complete(id));

        // Lowering the count completes transactions that already satisfy it
        tracker.set_expected(1);
        assert!(tracker.is_complete(id));
    }

    #[test]
    fn test_no_channels_completes_at_once() {
        let tracker = TransactionTracker::new(0);
        let id = TransactionId::new();
        let mut waiter = task::spawn(tracker.wait(id));
        assert_ready_ok!(waiter.poll());
        assert!(tracker.is_complete(id));

        // Once a channel joins, new transactions wait for it
        tracker.set_expected(1);
        let next = TransactionId::new();
        let mut waiter = task::spawn(tracker.wait(next));
        assert_pending!(waiter.poll());
        tracker.record_start(next);
        tracker.record_end(next);
        assert_ready_ok!(waiter.poll());
    }

    #[test]
    fn test_close_fails_pending_and_future_waiters() {
        let tracker = TransactionTracker::new(1);
        let done = TransactionId::new();
        let open = TransactionId::new();
        tracker.record_start(done);
        tracker.record_end(done);
        tracker.record_start(open);

        let mut waiter = task::spawn(tracker.wait(open));
        assert_pending!(waiter.poll());

        tracker.close(ShardError::TornDown("out".to_string()));
        assert_ready_err!(waiter.poll());

        let mut late = task::spawn(tracker.wait(TransactionId::new()));
        assert_ready_err!(late.poll());

        // Completed transactions keep their outcome
        let mut finished = task::spawn(tracker.wait(done));
        assert_ready_ok!(finished.poll());
    }

    #[test]
    fn test_fail_single_transaction() {
        let tracker = TransactionTracker::new(1);
        let id = TransactionId::new();
        tracker.record_start(id);
        let mut waiter = task::spawn(tracker.wait(id));
        assert_pending!(waiter.poll());

        tracker.fail(id, ShardError::Codec("bad frame".to_string()));
        let outcome = assert_ready!(waiter.poll());
        assert!(matches!(outcome, Err(ShardError::Codec(_))));

        // A later End does not overwrite the failure
        tracker.record_end(id);
        assert!(!tracker.is_complete(id));
    }

    #[test]
    fn test_channel_completion_closes_after_all_channels() {
        let tracker = TransactionTracker::new(2);
        tracker.channel_completed(ShardError::ChannelClosed("a".to_string()));
        assert!(!tracker.is_closed());
        tracker.channel_completed(ShardError::ChannelClosed("b".to_string()));
        assert!(tracker.is_closed());
    }
}
