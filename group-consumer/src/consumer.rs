use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::engine::{CommitMode, Engine};
use crate::error::{BrokerError, ConsumerError};
use crate::message::Message;
use crate::metrics_consts::{BATCH_COLLECTION_DURATION_MS, BATCH_SIZE, MESSAGES_POLLED, POLL_ERRORS};
use crate::topic_partition_list::{Offset, TopicPartitionList};

/// Default wait for committed offset and watermark queries.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(200);

/// Default wait for each watermark query issued by `Consumer::lag`.
pub const DEFAULT_LAG_WATERMARK_TIMEOUT: Duration = Duration::from_millis(100);

/// Default upper bound on a single engine wait inside the polling loops. Loops
/// notice `stop` within this interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lag per partition, grouped by topic.
pub type Lag = HashMap<String, HashMap<i32, i64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Loops keep polling.
    Active,
    /// Loops exit at their next check. Every other operation is still allowed.
    Stopped,
    /// The engine has been released. Nothing but state queries is allowed.
    Closed,
}

const ACTIVE: u8 = 0;
const STOPPED: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug)]
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Self {
        Self(AtomicU8::new(ACTIVE))
    }

    fn get(&self) -> ConsumerState {
        match self.0.load(Ordering::Acquire) {
            ACTIVE => ConsumerState::Active,
            STOPPED => ConsumerState::Stopped,
            _ => ConsumerState::Closed,
        }
    }

    fn stop(&self) {
        // Only Active moves to Stopped, a closed consumer stays closed.
        _ = self
            .0
            .compare_exchange(ACTIVE, STOPPED, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Returns true for the call that actually performed the transition.
    fn close(&self) -> bool {
        self.0.swap(CLOSED, Ordering::AcqRel) != CLOSED
    }
}

/// Stops the polling loops of a `Consumer` from anywhere: another thread, a
/// signal handler, or the loop's own message handler.
#[derive(Debug, Clone)]
pub struct StopHandle {
    lifecycle: Arc<Lifecycle>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.lifecycle.stop()
    }

    pub fn running(&self) -> bool {
        self.lifecycle.get() == ConsumerState::Active
    }
}

/// A consumer group member on top of a broker client engine.
///
/// The consumer owns its engine exclusively and is meant to be driven from a
/// single thread; use a `StopHandle` to interrupt its loops from elsewhere.
pub struct Consumer<E: Engine> {
    engine: Option<E>,
    lifecycle: Arc<Lifecycle>,
    poll_interval: Duration,
}

impl<E: Engine> Consumer<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Some(engine),
            lifecycle: Arc::new(Lifecycle::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the longest single engine wait used by `each`, `poll_batch` and `each_batch`.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> ConsumerState {
        self.lifecycle.get()
    }

    pub fn running(&self) -> bool {
        self.state() == ConsumerState::Active
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            lifecycle: self.lifecycle.clone(),
        }
    }

    /// Ask running loops to exit. The engine stays usable.
    pub fn stop(&self) {
        self.lifecycle.stop()
    }

    /// Release the engine. The consumer is unusable afterwards; closing again does nothing.
    pub fn close(&mut self) {
        if self.lifecycle.close() {
            info!("closing consumer");
        }
        if let Some(engine) = self.engine.take() {
            engine.close();
        }
    }

    fn engine(&self) -> Result<&E, ConsumerError> {
        match (self.lifecycle.get(), self.engine.as_ref()) {
            (ConsumerState::Closed, _) | (_, None) => {
                Err(ConsumerError::InvalidState(ConsumerState::Closed))
            }
            (_, Some(engine)) => Ok(engine),
        }
    }

    pub fn subscribe<I, T>(&self, topics: I) -> Result<(), ConsumerError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let engine = self.engine()?;
        let list = TopicPartitionList::with_topics(topics);
        debug!("subscribing to {}", list);
        engine.subscribe(&list).map_err(ConsumerError::Subscription)
    }

    pub fn unsubscribe(&self) -> Result<(), ConsumerError> {
        debug!("unsubscribing");
        self.engine()?
            .unsubscribe()
            .map_err(ConsumerError::Subscription)
    }

    pub fn subscription(&self) -> Result<TopicPartitionList, ConsumerError> {
        self.engine()?.subscription().map_err(ConsumerError::Query)
    }

    /// Take over partition assignment from the group. Every entry must name a
    /// concrete partition.
    pub fn assign(&self, assignment: &TopicPartitionList) -> Result<(), ConsumerError> {
        let engine = self.engine()?;
        if let Some(entry) = assignment.iter().find(|entry| entry.is_unassigned()) {
            return Err(ConsumerError::InvalidArgument(format!(
                "cannot assign all partitions of topic {}, partitions must be explicit",
                entry.topic
            )));
        }
        debug!("assigning {}", assignment);
        engine
            .assign(assignment)
            .map_err(|error| ConsumerError::Assignment {
                list: assignment.clone(),
                error,
            })
    }

    pub fn assignment(&self) -> Result<TopicPartitionList, ConsumerError> {
        self.engine()?.assignment().map_err(ConsumerError::Query)
    }

    /// Current fetch position of every assigned partition.
    pub fn position(&self) -> Result<TopicPartitionList, ConsumerError> {
        self.engine()?.position().map_err(ConsumerError::Query)
    }

    /// Last committed offsets of `partitions`, or of the current assignment when
    /// `None`. Partitions with nothing committed report `Offset::Unset`.
    pub fn committed(
        &self,
        partitions: Option<&TopicPartitionList>,
        timeout: Duration,
    ) -> Result<TopicPartitionList, ConsumerError> {
        let engine = self.engine()?;
        let assignment;
        let partitions = match partitions {
            Some(partitions) => partitions,
            None => {
                assignment = engine.assignment().map_err(ConsumerError::Query)?;
                &assignment
            }
        };

        let committed = engine
            .committed(partitions, timeout)
            .map_err(ConsumerError::CommitQuery)?;

        Ok(committed
            .iter()
            .cloned()
            .map(|mut entry| {
                if !entry.offset.is_real() {
                    entry.offset = Offset::Unset;
                }
                entry
            })
            .collect())
    }

    /// Low (oldest retained) and high (next to be written) offsets of a partition.
    pub fn query_watermark_offsets(
        &self,
        topic: &str,
        partition: i32,
        timeout: Duration,
    ) -> Result<(i64, i64), ConsumerError> {
        let engine = self.engine()?;
        if topic.is_empty() {
            return Err(ConsumerError::InvalidArgument(
                "topic name must not be empty".to_owned(),
            ));
        }
        if partition < 0 {
            return Err(ConsumerError::InvalidArgument(format!(
                "watermarks need a concrete partition, got {} for topic {}",
                partition, topic
            )));
        }

        engine
            .watermarks(topic, partition, timeout)
            .map_err(|error| ConsumerError::WatermarkQuery {
                topic: topic.to_owned(),
                partition,
                error,
            })
    }

    /// Lag of every entry in `partitions`: the partition's high watermark minus the
    /// entry's offset. Offsets are used as given, so sentinel offsets produce
    /// meaningless values; resolve them with `committed` first.
    ///
    /// Entries without a concrete partition are rejected with `InvalidArgument`
    /// before any query is made. Stops at the first failed watermark query.
    pub fn lag(
        &self,
        partitions: &TopicPartitionList,
        watermark_timeout: Duration,
    ) -> Result<Lag, ConsumerError> {
        self.engine()?;
        if let Some(entry) = partitions.iter().find(|entry| entry.is_unassigned()) {
            return Err(ConsumerError::InvalidArgument(format!(
                "lag needs concrete partitions, got every partition of topic {}",
                entry.topic
            )));
        }

        let mut lag = Lag::new();
        for entry in partitions {
            let (_, high) =
                self.query_watermark_offsets(&entry.topic, entry.partition, watermark_timeout)?;
            lag.entry(entry.topic.clone())
                .or_default()
                .insert(entry.partition, high - entry.offset.to_raw());
        }
        Ok(lag)
    }

    /// Commit `offsets`, or the offsets this consumer has stored so far when `None`.
    /// Delivered messages are stored automatically unless the engine runs with an
    /// explicit offset store, where `store_offset` does it.
    pub fn commit(
        &self,
        offsets: Option<&TopicPartitionList>,
        mode: CommitMode,
    ) -> Result<(), ConsumerError> {
        let engine = self.engine()?;
        match offsets {
            Some(offsets) => debug!("committing {} ({:?})", offsets, mode),
            None => debug!("committing consumer state ({:?})", mode),
        }
        engine.commit(offsets, mode).map_err(ConsumerError::Commit)
    }

    /// Mark `message` as processed: the next commit of the consumer state resumes
    /// right after it. Only valid when the engine does not store offsets on delivery.
    pub fn store_offset(&self, message: &Message) -> Result<(), ConsumerError> {
        self.engine()?
            .store_offset(message.topic(), message.partition(), message.offset() + 1)
            .map_err(ConsumerError::OffsetStore)
    }

    pub fn seek(
        &self,
        topic: &str,
        partition: i32,
        offset: Offset,
        timeout: Duration,
    ) -> Result<(), ConsumerError> {
        let engine = self.engine()?;
        debug!("seeking {}/{} to {}", topic, partition, offset);
        engine
            .seek(topic, partition, offset, timeout)
            .map_err(ConsumerError::Seek)
    }

    pub fn pause(&self, partitions: &TopicPartitionList) -> Result<(), ConsumerError> {
        self.engine()?
            .pause(partitions)
            .map_err(|error| partition_state_error(partitions, error))
    }

    pub fn resume(&self, partitions: &TopicPartitionList) -> Result<(), ConsumerError> {
        self.engine()?
            .resume(partitions)
            .map_err(|error| partition_state_error(partitions, error))
    }

    /// Wait up to `timeout` for one message. `Ok(None)` means nothing arrived in time.
    pub fn poll(&self, timeout: Duration) -> Result<Option<Message>, ConsumerError> {
        let engine = self.engine()?;
        match engine.poll_one(timeout) {
            None => Ok(None),
            Some(Err(error)) => {
                metrics::counter!(POLL_ERRORS).increment(1);
                Err(ConsumerError::Poll(error))
            }
            Some(Ok(record)) => {
                let message = Message::from_record(&record);
                drop(record);
                metrics::counter!(MESSAGES_POLLED, "topic" => message.topic().to_owned())
                    .increment(1);
                Ok(Some(message))
            }
        }
    }

    /// Hand every message to `handler` until the consumer is stopped or a poll fails.
    ///
    /// To end the loop from inside `handler`, capture a `StopHandle` and call `stop`.
    pub fn each<F>(&self, mut handler: F) -> Result<(), ConsumerError>
    where
        F: FnMut(Message),
    {
        self.engine()?;
        while self.running() {
            if let Some(message) = self.poll(self.poll_interval)? {
                handler(message);
            }
        }
        Ok(())
    }

    /// Collect up to `max_count` messages, for at most `timeout`, in delivery
    /// order. Returns early with what it has once the consumer is stopped. A failed
    /// poll discards the partial batch.
    pub fn poll_batch(
        &self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, ConsumerError> {
        self.engine()?;
        let start = Instant::now();
        let mut messages = Vec::new();

        while self.running() && messages.len() < max_count {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                break;
            }
            let wait = self.poll_interval.min(timeout - elapsed);
            if let Some(message) = self.poll(wait)? {
                messages.push(message);
            }
        }

        metrics::histogram!(BATCH_COLLECTION_DURATION_MS)
            .record(start.elapsed().as_millis() as f64);
        if !messages.is_empty() {
            metrics::histogram!(BATCH_SIZE).record(messages.len() as f64);
        }
        Ok(messages)
    }

    /// Hand batches from `poll_batch` to `handler` until the consumer is stopped or
    /// a poll fails. Empty batches are skipped.
    pub fn each_batch<F>(
        &self,
        max_count: usize,
        timeout: Duration,
        mut handler: F,
    ) -> Result<(), ConsumerError>
    where
        F: FnMut(Vec<Message>),
    {
        self.engine()?;
        while self.running() {
            let batch = self.poll_batch(max_count, timeout)?;
            if !batch.is_empty() {
                handler(batch);
            }
        }
        Ok(())
    }
}

impl<E: Engine> Drop for Consumer<E> {
    fn drop(&mut self) {
        self.close()
    }
}

fn partition_state_error(partitions: &TopicPartitionList, error: BrokerError) -> ConsumerError {
    ConsumerError::PartitionState {
        list: partitions.clone(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockEngine, MockOperation, TIMED_OUT};

    #[test]
    fn stop_is_idempotent_and_not_terminal() {
        let engine = MockEngine::new();
        engine.create_topic("orders", 1);
        let consumer = Consumer::new(engine.clone());
        assert!(consumer.running());

        consumer.stop();
        consumer.stop();
        assert!(!consumer.running());
        assert_eq!(consumer.state(), ConsumerState::Stopped);

        let watermarks = consumer
            .query_watermark_offsets("orders", 0, DEFAULT_QUERY_TIMEOUT)
            .expect("stopped consumers keep working");
        assert_eq!(watermarks, (0, 0));
    }

    #[test]
    fn close_releases_engine_once() {
        let engine = MockEngine::new();
        let mut consumer = Consumer::new(engine.clone());

        consumer.close();
        consumer.close();
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert!(!consumer.running());
        assert_eq!(engine.close_calls(), 1);

        drop(consumer);
        assert_eq!(engine.close_calls(), 1);
    }

    #[test]
    fn drop_closes_engine() {
        let engine = MockEngine::new();
        drop(Consumer::new(engine.clone()));
        assert_eq!(engine.close_calls(), 1);
    }

    #[test]
    fn stop_after_close_keeps_closed() {
        let mut consumer = Consumer::new(MockEngine::new());
        consumer.close();
        consumer.stop();
        consumer.stop_handle().stop();
        assert_eq!(consumer.state(), ConsumerState::Closed);
    }

    #[test]
    fn operations_after_close_fail_with_invalid_state() {
        let mut consumer = Consumer::new(MockEngine::new());
        consumer.close();

        let closed = |result: Result<(), ConsumerError>| {
            matches!(
                result,
                Err(ConsumerError::InvalidState(ConsumerState::Closed))
            )
        };

        assert!(closed(consumer.subscribe(["orders"])));
        assert!(closed(consumer.unsubscribe()));
        assert!(closed(consumer.subscription().map(|_| ())));
        assert!(closed(consumer.assign(&TopicPartitionList::new())));
        assert!(closed(consumer.assignment().map(|_| ())));
        assert!(closed(
            consumer.committed(None, DEFAULT_QUERY_TIMEOUT).map(|_| ())
        ));
        assert!(closed(
            consumer
                .query_watermark_offsets("orders", 0, DEFAULT_QUERY_TIMEOUT)
                .map(|_| ())
        ));
        assert!(closed(consumer.commit(None, CommitMode::Sync)));
        assert!(closed(
            consumer.poll(Duration::from_millis(10)).map(|_| ())
        ));
        assert!(closed(
            consumer
                .poll_batch(10, Duration::from_millis(10))
                .map(|_| ())
        ));
        assert!(closed(consumer.each(|_| panic!("closed consumer delivered"))));
        assert!(closed(consumer.each_batch(
            10,
            Duration::from_millis(10),
            |_| panic!("closed consumer delivered")
        )));
        assert!(closed(
            consumer
                .lag(&TopicPartitionList::new(), DEFAULT_QUERY_TIMEOUT)
                .map(|_| ())
        ));
    }

    #[test]
    fn stop_handle_is_shared() {
        let consumer = Consumer::new(MockEngine::new());
        let handle = consumer.stop_handle();
        assert!(handle.running());

        let thread_handle = handle.clone();
        std::thread::spawn(move || thread_handle.stop())
            .join()
            .expect("stop thread panicked");

        assert!(!handle.running());
        assert!(!consumer.running());
    }

    #[test]
    fn assign_rejects_unassigned_partitions() {
        let engine = MockEngine::new();
        let consumer = Consumer::new(engine.clone());

        let result = consumer.assign(&TopicPartitionList::with_topics(["orders"]));
        match result {
            Err(ConsumerError::InvalidArgument(reason)) => assert!(reason.contains("orders")),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(engine.assignment().expect("mock assignment").is_empty());
    }

    #[test]
    fn watermark_arguments_are_validated() {
        let consumer = Consumer::new(MockEngine::new());

        assert!(matches!(
            consumer.query_watermark_offsets("", 0, DEFAULT_QUERY_TIMEOUT),
            Err(ConsumerError::InvalidArgument(_))
        ));
        assert!(matches!(
            consumer.query_watermark_offsets("orders", -1, DEFAULT_QUERY_TIMEOUT),
            Err(ConsumerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn lag_rejects_unassigned_partitions() {
        let engine = MockEngine::new();
        engine.create_topic("orders", 1);
        let consumer = Consumer::new(engine.clone());

        let mut list = TopicPartitionList::new();
        list.add_partition_offset("orders", 0, Offset::At(0));
        list.add_topic_unassigned("payments");
        engine.fail_next(
            MockOperation::Watermarks,
            BrokerError::new(TIMED_OUT, "Local: Timed out"),
        );

        match consumer.lag(&list, DEFAULT_LAG_WATERMARK_TIMEOUT) {
            Err(ConsumerError::InvalidArgument(reason)) => assert!(reason.contains("payments")),
            other => panic!("unexpected result {:?}", other),
        }
        // Rejected before querying, so the queued failure is still pending
        assert!(consumer
            .query_watermark_offsets("orders", 0, DEFAULT_QUERY_TIMEOUT)
            .is_err());
    }

    #[test]
    fn poll_batch_with_zero_count_returns_immediately() {
        let engine = MockEngine::new();
        engine.create_topic("orders", 1);
        engine.produce("orders", 0, None, Some("one"));
        let consumer = Consumer::new(engine.clone());
        consumer
            .assign(&engine.all_partitions("orders"))
            .expect("failed to assign");

        let batch = consumer
            .poll_batch(0, Duration::from_secs(5))
            .expect("failed to poll");
        assert!(batch.is_empty());
    }

    #[test]
    fn poll_batch_on_stopped_consumer_is_empty() {
        let engine = MockEngine::new();
        engine.create_topic("orders", 1);
        engine.produce("orders", 0, None, Some("one"));
        let consumer = Consumer::new(engine.clone());
        consumer
            .assign(&engine.all_partitions("orders"))
            .expect("failed to assign");
        consumer.stop();

        let batch = consumer
            .poll_batch(10, Duration::from_secs(5))
            .expect("failed to poll");
        assert!(batch.is_empty());
        consumer
            .each_batch(10, Duration::from_secs(5), |_| panic!("loop should not run"))
            .expect("each_batch failed");
    }
}
