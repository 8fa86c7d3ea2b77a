use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use aeon_core::{LeaseToken, LockLease};

use super::r#trait::{LeasedItem, PriorityQueueStore, QueueError, QueueItem};

#[derive(Debug)]
struct Entry<T> {
    item: T,
    key: String,
    priority: i64,
    sequence: u64,
}

#[derive(Debug)]
struct Lane<T> {
    entries: VecDeque<Entry<T>>,
    lease: Option<LockLease>,
}

impl<T> Default for Lane<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            lease: None,
        }
    }
}

impl<T> Lane<T> {
    fn is_leasable_at(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_none_or(|lease| lease.is_expired_at(now))
    }
}

#[derive(Debug)]
struct QueueState<T> {
    lanes: HashMap<String, Lane<T>>,
    next_sequence: u64,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            lanes: HashMap::new(),
            next_sequence: 0,
        }
    }
}

impl<T> QueueState<T> {
    fn allocate_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Resolve a lane whose live lease is held by `token`.
    fn locked_lane(
        &mut self,
        discriminator: &str,
        token: LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<&mut Lane<T>, QueueError> {
        let lane = self
            .lanes
            .get_mut(discriminator)
            .ok_or_else(|| QueueError::ItemNotFound(discriminator.to_string()))?;

        match &lane.lease {
            Some(lease) if !lease.is_expired_at(now) => {
                if lease.token != token {
                    return Err(QueueError::TokenMismatch(discriminator.to_string()));
                }
            }
            _ => return Err(QueueError::ItemNotLocked(discriminator.to_string())),
        }

        Ok(lane)
    }

    fn release_if_drained(&mut self, discriminator: &str) {
        if self
            .lanes
            .get(discriminator)
            .is_some_and(|lane| lane.entries.is_empty() && lane.lease.is_none())
        {
            self.lanes.remove(discriminator);
        }
    }
}

/// In-memory priority queue.
///
/// One mutex guards all lanes; every operation is a short, non-blocking
/// critical section, so lanes never wait on each other's I/O.
#[derive(Debug)]
pub struct InMemoryPriorityQueueStore<T> {
    state: Mutex<QueueState<T>>,
    expiration_time: Duration,
}

impl<T: QueueItem> InMemoryPriorityQueueStore<T> {
    pub fn new(expiration_time: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            expiration_time,
        }
    }

    pub fn expiration_time(&self) -> Duration {
        self.expiration_time
    }

    /// Total number of queued entries across all lanes, leased or not.
    pub fn len(&self) -> Result<usize, QueueError> {
        let state = self.lock_state()?;
        Ok(state.lanes.values().map(|lane| lane.entries.len()).sum())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, QueueState<T>>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl<T: QueueItem> PriorityQueueStore<T> for InMemoryPriorityQueueStore<T> {
    async fn enqueue(&self, discriminator: &str, item: T, priority: i64) -> Result<(), QueueError> {
        let key = item.item_key();
        let mut state = self.lock_state()?;

        if state
            .lanes
            .get(discriminator)
            .is_some_and(|lane| lane.entries.iter().any(|entry| entry.key == key))
        {
            return Err(QueueError::ItemAlreadyQueued {
                discriminator: discriminator.to_string(),
                item_key: key,
            });
        }

        let sequence = state.allocate_sequence();
        state
            .lanes
            .entry(discriminator.to_string())
            .or_default()
            .entries
            .push_back(Entry {
                item,
                key,
                priority,
                sequence,
            });

        Ok(())
    }

    async fn lease(&self) -> Result<Option<LeasedItem<T>>, QueueError> {
        let now = Utc::now();
        let mut state = self.lock_state()?;

        let best = state
            .lanes
            .iter()
            .filter(|(_, lane)| lane.is_leasable_at(now))
            .filter_map(|(discriminator, lane)| {
                lane.entries
                    .front()
                    .map(|head| (head.priority, head.sequence, discriminator.clone()))
            })
            .min();

        let Some((_, _, discriminator)) = best else {
            return Ok(None);
        };

        let lease = LockLease::grant(discriminator.as_str(), now, self.expiration_time);
        let Some(lane) = state.lanes.get_mut(&discriminator) else {
            return Ok(None);
        };
        lane.lease = Some(lease.clone());

        Ok(lane.entries.front().map(|head| LeasedItem {
            item: head.item.clone(),
            priority: head.priority,
            lease,
        }))
    }

    async fn renew_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.lock_state()?;
        let lane = state.locked_lane(discriminator, token, now)?;
        if let Some(lease) = lane.lease.as_mut() {
            lease.renew(now, self.expiration_time);
        }
        Ok(())
    }

    async fn release_lock(&self, discriminator: &str, token: LeaseToken) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.lock_state()?;
        let lane = state.locked_lane(discriminator, token, now)?;
        lane.lease = None;
        Ok(())
    }

    async fn acknowledge(&self, discriminator: &str, token: LeaseToken) -> Result<T, QueueError> {
        let now = Utc::now();
        let mut state = self.lock_state()?;
        let lane = state.locked_lane(discriminator, token, now)?;

        let head = lane
            .entries
            .pop_front()
            .ok_or_else(|| QueueError::ItemNotFound(discriminator.to_string()))?;
        lane.lease = None;
        state.release_if_drained(discriminator);

        Ok(head.item)
    }

    async fn defer(
        &self,
        discriminator: &str,
        token: LeaseToken,
        priority: i64,
    ) -> Result<(), QueueError> {
        let now = Utc::now();
        let mut state = self.lock_state()?;
        let sequence = state.allocate_sequence();
        let lane = state.locked_lane(discriminator, token, now)?;

        let mut head = lane
            .entries
            .pop_front()
            .ok_or_else(|| QueueError::ItemNotFound(discriminator.to_string()))?;
        head.priority = priority;
        head.sequence = sequence;
        lane.entries.push_back(head);
        lane.lease = None;

        Ok(())
    }

    async fn sweep_expired_locks(&self) -> Result<Vec<LockLease>, QueueError> {
        let now = Utc::now();
        let mut state = self.lock_state()?;

        let mut expired = Vec::new();
        for lane in state.lanes.values_mut() {
            if lane.lease.as_ref().is_some_and(|lease| lease.is_expired_at(now)) {
                expired.extend(lane.lease.take());
            }
        }

        state.lanes.retain(|_, lane| !lane.entries.is_empty() || lane.lease.is_some());
        Ok(expired)
    }

    async fn is_queued(&self, discriminator: &str, item_key: &str) -> Result<bool, QueueError> {
        let state = self.lock_state()?;
        Ok(state
            .lanes
            .get(discriminator)
            .is_some_and(|lane| lane.entries.iter().any(|entry| entry.key == item_key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Job(String);

    impl QueueItem for Job {
        fn item_key(&self) -> String {
            self.0.clone()
        }
    }

    fn job(key: &str) -> Job {
        Job(key.to_string())
    }

    fn queue() -> InMemoryPriorityQueueStore<Job> {
        InMemoryPriorityQueueStore::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn leases_lowest_priority_head_across_lanes() {
        let queue = queue();
        queue.enqueue("a", job("a1"), 30).await.unwrap();
        queue.enqueue("b", job("b1"), 10).await.unwrap();
        queue.enqueue("c", job("c1"), 20).await.unwrap();

        let first = queue.lease().await.unwrap().unwrap();
        assert_eq!(first.item, job("b1"));
        let second = queue.lease().await.unwrap().unwrap();
        assert_eq!(second.item, job("c1"));
        let third = queue.lease().await.unwrap().unwrap();
        assert_eq!(third.item, job("a1"));
        assert!(queue.lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lane_is_fifo_even_with_lower_later_priority() {
        let queue = queue();
        queue.enqueue("a", job("first"), 50).await.unwrap();
        queue.enqueue("a", job("second"), 1).await.unwrap();

        let leased = queue.lease().await.unwrap().unwrap();
        assert_eq!(leased.item, job("first"));
    }

    #[tokio::test]
    async fn locked_lane_is_skipped() {
        let queue = queue();
        queue.enqueue("a", job("a1"), 1).await.unwrap();
        queue.enqueue("a", job("a2"), 2).await.unwrap();
        queue.enqueue("b", job("b1"), 3).await.unwrap();

        let a = queue.lease().await.unwrap().unwrap();
        assert_eq!(a.item, job("a1"));
        let b = queue.lease().await.unwrap().unwrap();
        assert_eq!(b.item, job("b1"));
        assert!(queue.lease().await.unwrap().is_none());

        let acked = queue.acknowledge("a", a.lease.token).await.unwrap();
        assert_eq!(acked, job("a1"));
        let next = queue.lease().await.unwrap().unwrap();
        assert_eq!(next.item, job("a2"));
    }

    #[tokio::test]
    async fn duplicate_item_in_lane_is_rejected() {
        let queue = queue();
        queue.enqueue("a", job("x"), 1).await.unwrap();
        let err = queue.enqueue("a", job("x"), 2).await.unwrap_err();
        assert!(matches!(err, QueueError::ItemAlreadyQueued { .. }));

        // Same key in another lane is fine.
        queue.enqueue("b", job("x"), 1).await.unwrap();
        assert!(queue.is_queued("a", "x").await.unwrap());
        assert!(!queue.is_queued("c", "x").await.unwrap());
    }

    #[tokio::test]
    async fn failure_precedence_for_token_operations() {
        let queue = queue();
        let stranger = LeaseToken::generate();

        assert!(matches!(
            queue.acknowledge("nope", stranger).await,
            Err(QueueError::ItemNotFound(_))
        ));

        queue.enqueue("a", job("a1"), 1).await.unwrap();
        assert!(matches!(
            queue.renew_lock("a", stranger).await,
            Err(QueueError::ItemNotLocked(_))
        ));

        let leased = queue.lease().await.unwrap().unwrap();
        assert!(matches!(
            queue.defer("a", stranger, 5).await,
            Err(QueueError::TokenMismatch(_))
        ));
        queue.renew_lock("a", leased.lease.token).await.unwrap();
    }

    #[tokio::test]
    async fn defer_moves_head_to_tail() {
        let queue = queue();
        queue.enqueue("a", job("r2"), 2).await.unwrap();
        queue.enqueue("a", job("r3"), 3).await.unwrap();

        let leased = queue.lease().await.unwrap().unwrap();
        assert_eq!(leased.item, job("r2"));
        queue.defer("a", leased.lease.token, 100).await.unwrap();

        let next = queue.lease().await.unwrap().unwrap();
        assert_eq!(next.item, job("r3"));
        queue.acknowledge("a", next.lease.token).await.unwrap();

        let last = queue.lease().await.unwrap().unwrap();
        assert_eq!(last.item, job("r2"));
        assert_eq!(last.priority, 100);
    }

    #[tokio::test]
    async fn release_keeps_head_first_in_line() {
        let queue = queue();
        queue.enqueue("a", job("a1"), 1).await.unwrap();
        queue.enqueue("a", job("a2"), 2).await.unwrap();

        let leased = queue.lease().await.unwrap().unwrap();
        queue.release_lock("a", leased.lease.token).await.unwrap();

        let again = queue.lease().await.unwrap().unwrap();
        assert_eq!(again.item, job("a1"));
        assert_ne!(again.lease.token, leased.lease.token);
    }

    #[tokio::test]
    async fn expired_lease_allows_new_lease_and_rejects_old_token() {
        let queue = InMemoryPriorityQueueStore::new(Duration::from_millis(20));
        queue.enqueue("a", job("a1"), 1).await.unwrap();

        let first = queue.lease().await.unwrap().unwrap();
        assert!(queue.lease().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(matches!(
            queue.acknowledge("a", first.lease.token).await,
            Err(QueueError::ItemNotLocked(_))
        ));

        let second = queue.lease().await.unwrap().unwrap();
        assert_eq!(second.item, job("a1"));
        assert_ne!(second.lease.token, first.lease.token);
        assert!(matches!(
            queue.acknowledge("a", first.lease.token).await,
            Err(QueueError::TokenMismatch(_))
        ));
        queue.acknowledge("a", second.lease.token).await.unwrap();
        assert!(queue.is_empty().unwrap());
    }

    #[tokio::test]
    async fn renew_extends_lease() {
        let queue = InMemoryPriorityQueueStore::new(Duration::from_millis(60));
        queue.enqueue("a", job("a1"), 1).await.unwrap();
        let leased = queue.lease().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        queue.renew_lock("a", leased.lease.token).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // 80ms after grant, but only 40ms after renewal.
        assert!(queue.lease().await.unwrap().is_none());
        queue.acknowledge("a", leased.lease.token).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_returns_expired_leases() {
        let queue = InMemoryPriorityQueueStore::new(Duration::from_millis(10));
        queue.enqueue("a", job("a1"), 1).await.unwrap();
        let leased = queue.lease().await.unwrap().unwrap();

        assert!(queue.sweep_expired_locks().await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let expired = queue.sweep_expired_locks().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].token, leased.lease.token);
        assert!(matches!(
            queue.renew_lock("a", leased.lease.token).await,
            Err(QueueError::ItemNotLocked(_))
        ));
        assert_eq!(queue.len().unwrap(), 1);
    }

    #[test]
    fn poisoned_lock_is_reported_by_len() {
        let queue = std::sync::Arc::new(queue());
        let holder = queue.clone();
        let _ = std::thread::spawn(move || {
            let _state = holder.state.lock().unwrap();
            panic!("poison the queue lock");
        })
        .join();

        assert!(matches!(queue.len(), Err(QueueError::Storage(_))));
        assert!(queue.is_empty().is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue { lane: usize, priority: i64 },
        Lease,
        Acknowledge { lane: usize },
        Defer { lane: usize, priority: i64 },
        Renew { lane: usize },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, -5..5i64).prop_map(|(lane, priority)| Op::Enqueue { lane, priority }),
            Just(Op::Lease),
            (0..3usize).prop_map(|lane| Op::Acknowledge { lane }),
            (0..3usize, -5..5i64).prop_map(|(lane, priority)| Op::Defer { lane, priority }),
            (0..3usize).prop_map(|lane| Op::Renew { lane }),
        ]
    }

    /// Reference model: lanes of (key, priority, sequence) plus live tokens.
    #[derive(Default)]
    struct Model {
        lanes: BTreeMap<String, VecDeque<(String, i64, u64)>>,
        leases: HashMap<String, LeaseToken>,
        sequence: u64,
        keys: u64,
    }

    impl Model {
        fn expected_lease(&self) -> Option<(String, String)> {
            self.lanes
                .iter()
                .filter(|(lane, _)| !self.leases.contains_key(*lane))
                .filter_map(|(lane, entries)| {
                    entries
                        .front()
                        .map(|(key, priority, sequence)| (*priority, *sequence, lane.clone(), key.clone()))
                })
                .min()
                .map(|(_, _, lane, key)| (lane, key))
        }
    }

    proptest! {
        #[test]
        fn matches_reference_model(ops in proptest::collection::vec(op(), 1..60)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();

            runtime.block_on(async {
                let queue = queue();
                let mut model = Model::default();
                let lanes = ["a", "b", "c"];

                for op in ops {
                    match op {
                        Op::Enqueue { lane, priority } => {
                            let key = format!("k{}", model.keys);
                            model.keys += 1;
                            queue.enqueue(lanes[lane], job(&key), priority).await.unwrap();
                            model.lanes.entry(lanes[lane].to_string()).or_default()
                                .push_back((key, priority, model.sequence));
                            model.sequence += 1;
                        }
                        Op::Lease => {
                            let leased = queue.lease().await.unwrap();
                            match (leased, model.expected_lease()) {
                                (None, None) => {}
                                (Some(leased), Some((lane, key))) => {
                                    assert_eq!(leased.lease.discriminator, lane);
                                    assert_eq!(leased.item, job(&key));
                                    // At most one live lease per discriminator.
                                    assert!(model.leases.insert(lane, leased.lease.token).is_none());
                                }
                                (actual, expected) => {
                                    panic!("lease mismatch: {actual:?} vs {expected:?}")
                                }
                            }
                        }
                        Op::Acknowledge { lane } => {
                            let lane = lanes[lane];
                            match model.leases.remove(lane) {
                                Some(token) => {
                                    let acked = queue.acknowledge(lane, token).await.unwrap();
                                    let entries = model.lanes.get_mut(lane).unwrap();
                                    let (key, _, _) = entries.pop_front().unwrap();
                                    assert_eq!(acked, job(&key));
                                    if entries.is_empty() {
                                        model.lanes.remove(lane);
                                    }
                                }
                                None => {
                                    assert!(queue.acknowledge(lane, LeaseToken::generate()).await.is_err());
                                }
                            }
                        }
                        Op::Defer { lane, priority } => {
                            let lane = lanes[lane];
                            match model.leases.remove(lane) {
                                Some(token) => {
                                    queue.defer(lane, token, priority).await.unwrap();
                                    let entries = model.lanes.get_mut(lane).unwrap();
                                    let (key, _, _) = entries.pop_front().unwrap();
                                    entries.push_back((key, priority, model.sequence));
                                }
                                None => {
                                    assert!(queue.defer(lane, LeaseToken::generate(), priority).await.is_err());
                                }
                            }
                            // Sequence numbers are drawn even when the defer is rejected.
                            model.sequence += 1;
                        }
                        Op::Renew { lane } => {
                            let lane = lanes[lane];
                            match model.leases.get(lane) {
                                Some(token) => queue.renew_lock(lane, *token).await.unwrap(),
                                None => {
                                    assert!(queue.renew_lock(lane, LeaseToken::generate()).await.is_err());
                                }
                            }
                        }
                    }
                }
            });
        }
    }
}
