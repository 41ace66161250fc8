//! An in-memory broker client engine for tests.
//!
//! `MockEngine` models one broker and one group member: topics with partition
//! logs, watermarks, committed offsets, a subscription, an assignment and fetch
//! positions. Clones share state, so a test can keep a clone to drive and inspect
//! the engine while a `Consumer` owns another.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::engine::{CommitMode, Engine, RawRecord};
use crate::error::BrokerError;
use crate::message::MessageHeader;
use crate::topic_partition_list::{Offset, TopicPartitionList, PARTITION_UNASSIGNED};

pub const UNKNOWN_TOPIC_OR_PARTITION: i32 = 3;
pub const NO_OFFSET: i32 = -168;
pub const ERRONEOUS_STATE: i32 = -172;
pub const TIMED_OUT: i32 = -185;
pub const INVALID_ARGUMENT: i32 = -186;
pub const UNKNOWN_PARTITION: i32 = -190;

/// Engine operations that can be made to fail with `MockEngine::fail_next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Subscribe,
    Unsubscribe,
    Subscription,
    Assign,
    Assignment,
    Position,
    Committed,
    Watermarks,
    Commit,
    StoreOffset,
    Seek,
    Pause,
    Resume,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    timestamp: i64,
    headers: Vec<MessageHeader>,
}

#[derive(Debug, Default)]
struct PartitionLog {
    low: i64,
    records: Vec<StoredRecord>,
}

impl PartitionLog {
    fn high(&self) -> i64 {
        self.low + self.records.len() as i64
    }

    fn get(&self, offset: i64) -> Option<&StoredRecord> {
        if offset < self.low {
            return None;
        }
        usize::try_from(offset - self.low)
            .ok()
            .and_then(|index| self.records.get(index))
    }
}

type Key = (String, i32);

#[derive(Debug, Default)]
struct MockState {
    logs: HashMap<Key, PartitionLog>,
    subscription: TopicPartitionList,
    assignment: TopicPartitionList,
    positions: HashMap<Key, i64>,
    stored: HashMap<Key, i64>,
    committed: HashMap<Key, (i64, String)>,
    paused: HashSet<Key>,
    auto_offset_store: bool,
    poll_errors: VecDeque<BrokerError>,
    poll_failure_after: Option<(usize, BrokerError)>,
    failures: HashMap<MockOperation, BrokerError>,
    commits: Vec<(TopicPartitionList, CommitMode)>,
    close_calls: usize,
}

impl MockState {
    fn take_failure(&mut self, operation: MockOperation) -> Result<(), BrokerError> {
        match self.failures.remove(&operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn is_assigned(&self, topic: &str, partition: i32) -> bool {
        self.assignment.find_partition(topic, partition).is_some()
    }

    /// Where fetching starts for a newly assigned partition, following
    /// `auto.offset.reset=earliest` when nothing is committed.
    fn start_position(&self, key: &Key, requested: Offset) -> i64 {
        let low = self.logs.get(key).map(|log| log.low).unwrap_or(0);
        match requested {
            Offset::At(offset) => offset,
            Offset::Beginning => low,
            _ => self
                .committed
                .get(key)
                .map(|(offset, _)| *offset)
                .unwrap_or(low),
        }
    }

    fn assign(&mut self, assignment: TopicPartitionList) {
        self.positions.clear();
        self.stored.clear();
        self.paused.clear();
        for entry in &assignment {
            let key = (entry.topic.clone(), entry.partition);
            let position = self.start_position(&key, entry.offset);
            self.positions.insert(key, position);
        }
        self.assignment = assignment;
    }

    /// Next deliverable record across assigned, unpaused partitions, in assignment
    /// order. Delivery advances the position and, with the automatic offset store,
    /// the stored offset.
    fn next_record(&mut self) -> Option<StoredRecord> {
        let mut found = None;
        for entry in &self.assignment {
            let key = (entry.topic.clone(), entry.partition);
            if self.paused.contains(&key) {
                continue;
            }
            let Some(position) = self.positions.get(&key) else {
                continue;
            };
            if let Some(record) = self.logs.get(&key).and_then(|log| log.get(*position)) {
                found = Some(record.clone());
                break;
            }
        }

        let record = found?;
        let key = (record.topic.clone(), record.partition);
        if self.auto_offset_store {
            self.stored.insert(key.clone(), record.offset + 1);
        }
        self.positions.insert(key, record.offset + 1);
        Some(record)
    }
}

struct Shared {
    state: Mutex<MockState>,
    available: Condvar,
    outstanding: AtomicUsize,
}

#[derive(Clone)]
pub struct MockEngine {
    shared: Arc<Shared>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    auto_offset_store: true,
                    ..Default::default()
                }),
                available: Condvar::new(),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Stop storing offsets on delivery, as `enable.auto.offset.store=false` does.
    /// Offsets then have to be stored with `store_offset`.
    pub fn with_explicit_offset_store(self) -> Self {
        self.state().auto_offset_store = false;
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.shared.state.lock().expect("poisoned mock engine state")
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.state();
        for partition in 0..partitions {
            state
                .logs
                .entry((topic.to_owned(), partition))
                .or_default();
        }
    }

    /// Append a record to a partition log and return its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        payload: Option<&str>,
    ) -> i64 {
        self.produce_with_headers(
            topic,
            partition,
            key.map(str::as_bytes),
            payload.map(str::as_bytes),
            Vec::new(),
        )
    }

    pub fn produce_with_headers(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
        headers: Vec<MessageHeader>,
    ) -> i64 {
        let mut state = self.state();
        let log = state.logs.entry((topic.to_owned(), partition)).or_default();
        let offset = log.high();
        log.records.push(StoredRecord {
            topic: topic.to_owned(),
            partition,
            offset,
            key: key.map(<[u8]>::to_vec),
            payload: payload.map(<[u8]>::to_vec),
            timestamp: 1_700_000_000_000 + offset,
            headers,
        });
        drop(state);
        self.shared.available.notify_all();
        offset
    }

    /// Drop records below `low`, as retention would.
    pub fn truncate(&self, topic: &str, partition: i32, low: i64) {
        let mut state = self.state();
        if let Some(log) = state.logs.get_mut(&(topic.to_owned(), partition)) {
            let removed = (low - log.low).clamp(0, log.records.len() as i64);
            log.records.drain(..removed as usize);
            log.low += removed;
        }
    }

    /// Assign every partition of the subscribed topics to this member, as a group
    /// rebalance with a single member would.
    pub fn rebalance(&self) {
        let mut state = self.state();
        let mut assignment = TopicPartitionList::new();
        for topic in state.subscription.topics() {
            let mut partitions: Vec<i32> = state
                .logs
                .keys()
                .filter(|(name, _)| name == topic)
                .map(|(_, partition)| *partition)
                .collect();
            partitions.sort_unstable();
            for partition in partitions {
                assignment.add_partition_offset(topic, partition, Offset::Stored);
            }
        }
        state.assign(assignment);
        drop(state);
        self.shared.available.notify_all();
    }

    /// Every partition of `topic`, starting from the beginning of the log.
    pub fn all_partitions(&self, topic: &str) -> TopicPartitionList {
        let state = self.state();
        let mut partitions: Vec<i32> = state
            .logs
            .keys()
            .filter(|(name, _)| name == topic)
            .map(|(_, partition)| *partition)
            .collect();
        partitions.sort_unstable();

        let mut list = TopicPartitionList::new();
        for partition in partitions {
            list.add_partition_offset(topic, partition, Offset::Beginning);
        }
        list
    }

    /// Make the next call of `operation` fail with `error`.
    pub fn fail_next(&self, operation: MockOperation, error: BrokerError) {
        self.state().failures.insert(operation, error);
    }

    /// Queue a failed delivery, returned by the next poll ahead of any record.
    pub fn fail_next_poll(&self, error: BrokerError) {
        self.state().poll_errors.push_back(error);
        self.shared.available.notify_all();
    }

    /// Fail the poll that follows the next `records` deliveries with `error`.
    pub fn fail_poll_after(&self, records: usize, error: BrokerError) {
        self.state().poll_failure_after = Some((records, error));
        self.shared.available.notify_all();
    }

    /// Records handed out by `poll_one` that have not been dropped yet.
    pub fn outstanding_records(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }

    /// Every commit accepted so far, with the offsets it wrote.
    pub fn commits(&self) -> Vec<(TopicPartitionList, CommitMode)> {
        self.state().commits.clone()
    }

    pub fn is_paused(&self, topic: &str, partition: i32) -> bool {
        self.state()
            .paused
            .contains(&(topic.to_owned(), partition))
    }
}

/// A delivery handed out by `MockEngine`, counted until dropped.
pub struct MockRecord<'a> {
    record: StoredRecord,
    outstanding: &'a AtomicUsize,
}

impl<'a> MockRecord<'a> {
    fn new(record: StoredRecord, outstanding: &'a AtomicUsize) -> Self {
        outstanding.fetch_add(1, Ordering::SeqCst);
        Self {
            record,
            outstanding,
        }
    }
}

impl Drop for MockRecord<'_> {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RawRecord for MockRecord<'_> {
    fn topic(&self) -> &str {
        &self.record.topic
    }

    fn partition(&self) -> i32 {
        self.record.partition
    }

    fn offset(&self) -> i64 {
        self.record.offset
    }

    fn key(&self) -> Option<&[u8]> {
        self.record.key.as_deref()
    }

    fn payload(&self) -> Option<&[u8]> {
        self.record.payload.as_deref()
    }

    fn timestamp_millis(&self) -> Option<i64> {
        Some(self.record.timestamp)
    }

    fn headers(&self) -> Vec<MessageHeader> {
        self.record.headers.clone()
    }
}

fn invalid_topic_name(topic: &str) -> bool {
    topic.is_empty()
        || topic.len() > 249
        || !topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

impl Engine for MockEngine {
    type Record<'a> = MockRecord<'a>;

    fn subscribe(&self, topics: &TopicPartitionList) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Subscribe)?;
        if let Some(topic) = topics.topics().into_iter().find(|t| invalid_topic_name(t)) {
            return Err(BrokerError::new(
                INVALID_ARGUMENT,
                format!("Local: Invalid argument or configuration: topic {:?}", topic),
            ));
        }
        state.subscription = TopicPartitionList::with_topics(topics.topics());
        Ok(())
    }

    fn unsubscribe(&self) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Unsubscribe)?;
        state.subscription = TopicPartitionList::new();
        state.assign(TopicPartitionList::new());
        Ok(())
    }

    fn subscription(&self) -> Result<TopicPartitionList, BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Subscription)?;
        Ok(state.subscription.clone())
    }

    fn assign(&self, assignment: &TopicPartitionList) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Assign)?;
        state.assign(assignment.clone());
        drop(state);
        self.shared.available.notify_all();
        Ok(())
    }

    fn assignment(&self) -> Result<TopicPartitionList, BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Assignment)?;
        Ok(state.assignment.clone())
    }

    fn position(&self) -> Result<TopicPartitionList, BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Position)?;
        Ok(state
            .assignment
            .iter()
            .map(|entry| {
                let mut entry = entry.clone();
                entry.offset = state
                    .positions
                    .get(&(entry.topic.clone(), entry.partition))
                    .map(|position| Offset::At(*position))
                    .unwrap_or(Offset::Invalid);
                entry
            })
            .collect())
    }

    fn committed(
        &self,
        partitions: &TopicPartitionList,
        _timeout: Duration,
    ) -> Result<TopicPartitionList, BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Committed)?;
        Ok(partitions
            .iter()
            .map(|entry| {
                let mut entry = entry.clone();
                match state.committed.get(&(entry.topic.clone(), entry.partition)) {
                    Some((offset, metadata)) => {
                        entry.offset = Offset::At(*offset);
                        entry.metadata = metadata.clone();
                    }
                    None => entry.offset = Offset::Unset,
                }
                entry
            })
            .collect())
    }

    fn watermarks(
        &self,
        topic: &str,
        partition: i32,
        _timeout: Duration,
    ) -> Result<(i64, i64), BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Watermarks)?;
        match state.logs.get(&(topic.to_owned(), partition)) {
            Some(log) => Ok((log.low, log.high())),
            None => Err(BrokerError::new(
                UNKNOWN_TOPIC_OR_PARTITION,
                "Broker: Unknown topic or partition",
            )),
        }
    }

    fn commit(
        &self,
        offsets: Option<&TopicPartitionList>,
        mode: CommitMode,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Commit)?;

        let to_commit: TopicPartitionList = match offsets {
            Some(offsets) => offsets
                .iter()
                .filter(|entry| entry.offset.is_real() && entry.partition != PARTITION_UNASSIGNED)
                .cloned()
                .collect(),
            None => state
                .assignment
                .iter()
                .filter_map(|entry| {
                    let key = (entry.topic.clone(), entry.partition);
                    state.stored.get(&key).map(|offset| {
                        let mut entry = entry.clone();
                        entry.offset = Offset::At(*offset);
                        entry
                    })
                })
                .collect(),
        };

        if to_commit.is_empty() {
            return Err(BrokerError::new(NO_OFFSET, "Local: No offset stored"));
        }

        for entry in &to_commit {
            let offset = entry.offset.to_raw();
            state.committed.insert(
                (entry.topic.clone(), entry.partition),
                (offset, entry.metadata.clone()),
            );
        }
        state.commits.push((to_commit, mode));
        Ok(())
    }

    fn store_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::StoreOffset)?;
        if state.auto_offset_store {
            return Err(BrokerError::new(
                INVALID_ARGUMENT,
                "Local: Invalid argument or configuration: enable.auto.offset.store is true",
            ));
        }
        if !state.is_assigned(topic, partition) {
            return Err(BrokerError::new(ERRONEOUS_STATE, "Local: Erroneous state"));
        }
        state.stored.insert((topic.to_owned(), partition), offset);
        Ok(())
    }

    fn seek(
        &self,
        topic: &str,
        partition: i32,
        offset: Offset,
        _timeout: Duration,
    ) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Seek)?;
        if !state.is_assigned(topic, partition) {
            return Err(BrokerError::new(ERRONEOUS_STATE, "Local: Erroneous state"));
        }
        let key = (topic.to_owned(), partition);
        let position = match offset {
            Offset::At(offset) => offset,
            Offset::Beginning => state.logs.get(&key).map(|log| log.low).unwrap_or(0),
            other => {
                return Err(BrokerError::new(
                    INVALID_ARGUMENT,
                    format!("Local: Invalid argument or configuration: offset {}", other),
                ))
            }
        };
        state.positions.insert(key, position);
        drop(state);
        self.shared.available.notify_all();
        Ok(())
    }

    fn pause(&self, partitions: &TopicPartitionList) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Pause)?;
        if partitions
            .iter()
            .any(|entry| !state.is_assigned(&entry.topic, entry.partition))
        {
            return Err(BrokerError::new(UNKNOWN_PARTITION, "Local: Unknown partition"));
        }
        for entry in partitions {
            state.paused.insert((entry.topic.clone(), entry.partition));
        }
        Ok(())
    }

    fn resume(&self, partitions: &TopicPartitionList) -> Result<(), BrokerError> {
        let mut state = self.state();
        state.take_failure(MockOperation::Resume)?;
        if partitions
            .iter()
            .any(|entry| !state.is_assigned(&entry.topic, entry.partition))
        {
            return Err(BrokerError::new(UNKNOWN_PARTITION, "Local: Unknown partition"));
        }
        for entry in partitions {
            state.paused.remove(&(entry.topic.clone(), entry.partition));
        }
        drop(state);
        self.shared.available.notify_all();
        Ok(())
    }

    fn poll_one(&self, timeout: Duration) -> Option<Result<Self::Record<'_>, BrokerError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if let Some(error) = state.poll_errors.pop_front() {
                return Some(Err(error));
            }
            if let Some((0, _)) = state.poll_failure_after {
                if let Some((_, error)) = state.poll_failure_after.take() {
                    return Some(Err(error));
                }
            }
            if let Some(record) = state.next_record() {
                if let Some((remaining, _)) = state.poll_failure_after.as_mut() {
                    *remaining -= 1;
                }
                return Some(Ok(MockRecord::new(record, &self.shared.outstanding)));
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .expect("poisoned mock engine state")
                .0;
        }
    }

    fn close(self) {
        let mut state = self.state();
        state.close_calls += 1;
        state.subscription = TopicPartitionList::new();
        state.assign(TopicPartitionList::new());
    }
}
