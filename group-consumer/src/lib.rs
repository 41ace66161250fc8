pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod kafka_engine;
pub mod message;
pub mod metrics_consts;
pub mod test_utils;
pub mod topic_partition_list;

pub use consumer::{Consumer, ConsumerState, Lag, StopHandle};
pub use engine::{CommitMode, Engine, RawRecord};
pub use error::{BrokerError, ConsumerError};
pub use kafka_engine::KafkaEngine;
pub use message::{Message, MessageHeader};
pub use topic_partition_list::{Offset, TopicPartitionEntry, TopicPartitionList};
