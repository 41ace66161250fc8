//! The boundary with the broker client engine: the component that owns the
//! network connections, group membership and fetching, and answers one request
//! at a time on behalf of a `Consumer`.
use std::time::Duration;

use crate::error::BrokerError;
use crate::message::MessageHeader;
use crate::topic_partition_list::{Offset, TopicPartitionList};

/// Whether a commit waits for the broker acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Block until the broker acknowledges the commit.
    Sync,
    /// Return as soon as the commit request is enqueued.
    Async,
}

/// One delivery as handed out by the engine. Records borrow engine-owned memory
/// and are released when dropped.
pub trait RawRecord {
    fn topic(&self) -> &str;
    fn partition(&self) -> i32;
    fn offset(&self) -> i64;
    fn key(&self) -> Option<&[u8]>;
    fn payload(&self) -> Option<&[u8]>;
    /// Milliseconds since the Unix epoch, when the broker provided one.
    fn timestamp_millis(&self) -> Option<i64>;
    fn headers(&self) -> Vec<MessageHeader>;
}

/// Operations a `Consumer` needs from the broker client engine. Every failure is
/// reported as a `BrokerError`, translated by the engine from its status code.
pub trait Engine {
    type Record<'a>: RawRecord
    where
        Self: 'a;

    fn subscribe(&self, topics: &TopicPartitionList) -> Result<(), BrokerError>;

    fn unsubscribe(&self) -> Result<(), BrokerError>;

    fn subscription(&self) -> Result<TopicPartitionList, BrokerError>;

    fn assign(&self, assignment: &TopicPartitionList) -> Result<(), BrokerError>;

    fn assignment(&self) -> Result<TopicPartitionList, BrokerError>;

    fn position(&self) -> Result<TopicPartitionList, BrokerError>;

    fn committed(
        &self,
        partitions: &TopicPartitionList,
        timeout: Duration,
    ) -> Result<TopicPartitionList, BrokerError>;

    /// Low (oldest retained) and high (next to be written) offsets of a partition.
    fn watermarks(
        &self,
        topic: &str,
        partition: i32,
        timeout: Duration,
    ) -> Result<(i64, i64), BrokerError>;

    /// Commit the given offsets, or the current consumer state when `offsets` is `None`.
    fn commit(
        &self,
        offsets: Option<&TopicPartitionList>,
        mode: CommitMode,
    ) -> Result<(), BrokerError>;

    fn store_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError>;

    fn seek(
        &self,
        topic: &str,
        partition: i32,
        offset: Offset,
        timeout: Duration,
    ) -> Result<(), BrokerError>;

    fn pause(&self, partitions: &TopicPartitionList) -> Result<(), BrokerError>;

    fn resume(&self, partitions: &TopicPartitionList) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for one delivery. `None` means nothing arrived in time.
    fn poll_one(&self, timeout: Duration) -> Option<Result<Self::Record<'_>, BrokerError>>;

    /// Leave the group and release every resource held by the engine.
    fn close(self);
}
