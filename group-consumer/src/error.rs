use thiserror::Error;

use crate::consumer::ConsumerState;
use crate::topic_partition_list::TopicPartitionList;

/// A failure reported by the broker client engine: the engine's status code and
/// its description of it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{description} (code {code})")]
pub struct BrokerError {
    pub code: i32,
    pub description: String,
}

impl BrokerError {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Enumeration of errors for operations with a `Consumer`.
///
/// `InvalidArgument` and `InvalidState` mean the API was misused; every other
/// variant carries the `BrokerError` of a request the engine rejected.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("error subscribing to topics: {0}")]
    Subscription(BrokerError),
    #[error("error assigning partitions {list}: {error}")]
    Assignment {
        list: TopicPartitionList,
        error: BrokerError,
    },
    #[error("error querying consumer state: {0}")]
    Query(BrokerError),
    #[error("error querying committed offsets: {0}")]
    CommitQuery(BrokerError),
    #[error("error querying watermark offsets for {topic}/{partition}: {error}")]
    WatermarkQuery {
        topic: String,
        partition: i32,
        error: BrokerError,
    },
    #[error("error committing offsets: {0}")]
    Commit(BrokerError),
    #[error("error polling for messages: {0}")]
    Poll(BrokerError),
    #[error("error storing offset: {0}")]
    OffsetStore(BrokerError),
    #[error("error seeking: {0}")]
    Seek(BrokerError),
    #[error("error changing fetch state of partitions {list}: {error}")]
    PartitionState {
        list: TopicPartitionList,
        error: BrokerError,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("operation not allowed, consumer is {0:?}")]
    InvalidState(ConsumerState),
}

impl ConsumerError {
    /// The broker status code behind this error, if the engine reported one.
    pub fn code(&self) -> Option<i32> {
        self.broker_error().map(|error| error.code)
    }

    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            ConsumerError::Subscription(error)
            | ConsumerError::Query(error)
            | ConsumerError::CommitQuery(error)
            | ConsumerError::Commit(error)
            | ConsumerError::Poll(error)
            | ConsumerError::OffsetStore(error)
            | ConsumerError::Seek(error)
            | ConsumerError::Assignment { error, .. }
            | ConsumerError::WatermarkQuery { error, .. }
            | ConsumerError::PartitionState { error, .. } => Some(error),
            ConsumerError::InvalidArgument(_) | ConsumerError::InvalidState(_) => None,
        }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            ConsumerError::InvalidArgument(_) | ConsumerError::InvalidState(_)
        )
    }
}
