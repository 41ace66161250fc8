use std::time::Duration;

use metrics::{counter, gauge};
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::ClientConfig;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::engine::{CommitMode, Engine, RawRecord};
use crate::error::BrokerError;
use crate::message::MessageHeader;
use crate::metrics_consts::{
    KAFKA_BROKER_RX_ERRORS, KAFKA_BROKER_TX_ERRORS, KAFKA_CALLBACK_QUEUE_DEPTH,
    KAFKA_COMMIT_FAILURES, KAFKA_REBALANCES,
};
use crate::topic_partition_list::{Offset, TopicPartitionEntry, TopicPartitionList};

pub struct KafkaConsumerContext;

impl rdkafka::ClientContext for KafkaConsumerContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!(KAFKA_CALLBACK_QUEUE_DEPTH).set(stats.replyq as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            counter!(KAFKA_BROKER_TX_ERRORS, "broker" => id_string.clone()).absolute(stats.txerrs);
            counter!(KAFKA_BROKER_RX_ERRORS, "broker" => id_string).absolute(stats.rxerrs);
        }
    }
}

impl ConsumerContext for KafkaConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!("assigning {} partitions", partitions.count())
            }
            Rebalance::Revoke(partitions) => {
                info!("revoking {} partitions", partitions.count())
            }
            Rebalance::Error(err) => warn!("rebalance failed: {}", err),
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        let kind = match rebalance {
            Rebalance::Assign(_) => "assign",
            Rebalance::Revoke(_) => "revoke",
            Rebalance::Error(_) => "error",
        };
        counter!(KAFKA_REBALANCES, "kind" => kind).increment(1);
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &rdkafka::TopicPartitionList) {
        match result {
            Ok(()) => debug!("committed offsets for {} partitions", offsets.count()),
            Err(err) => {
                counter!(KAFKA_COMMIT_FAILURES).increment(1);
                warn!("failed to commit offsets: {}", err);
            }
        }
    }
}

impl From<KafkaError> for BrokerError {
    fn from(error: KafkaError) -> Self {
        let code = error.rdkafka_error_code().unwrap_or(RDKafkaErrorCode::Fail);
        BrokerError::new(code as i32, error.to_string())
    }
}

fn to_rdkafka_list(list: &TopicPartitionList) -> Result<rdkafka::TopicPartitionList, BrokerError> {
    let mut rd_list = rdkafka::TopicPartitionList::with_capacity(list.len());
    for entry in list {
        let mut element = rd_list.add_partition(&entry.topic, entry.partition);
        element.set_offset(rdkafka::Offset::from_raw(entry.offset.to_raw()))?;
        if !entry.metadata.is_empty() {
            element.set_metadata(&entry.metadata);
        }
    }
    Ok(rd_list)
}

fn from_rdkafka_list(rd_list: &rdkafka::TopicPartitionList) -> TopicPartitionList {
    rd_list
        .elements()
        .into_iter()
        .map(|element| {
            let raw = element
                .offset()
                .to_raw()
                .unwrap_or(Offset::Invalid.to_raw());
            let mut entry =
                TopicPartitionEntry::new(element.topic(), element.partition(), Offset::from_raw(raw));
            entry.metadata = element.metadata().to_owned();
            entry
        })
        .collect()
}

fn to_rdkafka_mode(mode: CommitMode) -> rdkafka::consumer::CommitMode {
    match mode {
        CommitMode::Sync => rdkafka::consumer::CommitMode::Sync,
        CommitMode::Async => rdkafka::consumer::CommitMode::Async,
    }
}

impl RawRecord for BorrowedMessage<'_> {
    fn topic(&self) -> &str {
        rdkafka::Message::topic(self)
    }

    fn partition(&self) -> i32 {
        rdkafka::Message::partition(self)
    }

    fn offset(&self) -> i64 {
        rdkafka::Message::offset(self)
    }

    fn key(&self) -> Option<&[u8]> {
        rdkafka::Message::key(self)
    }

    fn payload(&self) -> Option<&[u8]> {
        rdkafka::Message::payload(self)
    }

    fn timestamp_millis(&self) -> Option<i64> {
        rdkafka::Message::timestamp(self).to_millis()
    }

    fn headers(&self) -> Vec<MessageHeader> {
        let Some(headers) = rdkafka::Message::headers(self) else {
            return Vec::new();
        };
        (0..headers.count())
            .map(|index| {
                let header = headers.get(index);
                MessageHeader {
                    key: header.key.to_owned(),
                    value: header.value.map(<[u8]>::to_vec),
                }
            })
            .collect()
    }
}

/// Broker client engine backed by librdkafka.
pub struct KafkaEngine {
    consumer: BaseConsumer<KafkaConsumerContext>,
}

impl KafkaEngine {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);
        Self::from_client_config(&ClientConfig::from(config))
    }

    pub fn from_client_config(client_config: &ClientConfig) -> Result<Self, KafkaError> {
        debug!("rdkafka configuration: {:?}", client_config);
        let consumer = client_config.create_with_context(KafkaConsumerContext)?;
        Ok(Self { consumer })
    }
}

impl Engine for KafkaEngine {
    type Record<'a> = BorrowedMessage<'a>;

    fn subscribe(&self, topics: &TopicPartitionList) -> Result<(), BrokerError> {
        let topics = topics.topics();
        Ok(self.consumer.subscribe(&topics)?)
    }

    fn unsubscribe(&self) -> Result<(), BrokerError> {
        self.consumer.unsubscribe();
        Ok(())
    }

    fn subscription(&self) -> Result<TopicPartitionList, BrokerError> {
        Ok(from_rdkafka_list(&self.consumer.subscription()?))
    }

    fn assign(&self, assignment: &TopicPartitionList) -> Result<(), BrokerError> {
        Ok(self.consumer.assign(&to_rdkafka_list(assignment)?)?)
    }

    fn assignment(&self) -> Result<TopicPartitionList, BrokerError> {
        Ok(from_rdkafka_list(&self.consumer.assignment()?))
    }

    fn position(&self) -> Result<TopicPartitionList, BrokerError> {
        Ok(from_rdkafka_list(&self.consumer.position()?))
    }

    fn committed(
        &self,
        partitions: &TopicPartitionList,
        timeout: Duration,
    ) -> Result<TopicPartitionList, BrokerError> {
        let committed = self
            .consumer
            .committed_offsets(to_rdkafka_list(partitions)?, timeout)?;
        Ok(from_rdkafka_list(&committed))
    }

    fn watermarks(
        &self,
        topic: &str,
        partition: i32,
        timeout: Duration,
    ) -> Result<(i64, i64), BrokerError> {
        Ok(self.consumer.fetch_watermarks(topic, partition, timeout)?)
    }

    fn commit(
        &self,
        offsets: Option<&TopicPartitionList>,
        mode: CommitMode,
    ) -> Result<(), BrokerError> {
        let mode = to_rdkafka_mode(mode);
        match offsets {
            Some(offsets) => Ok(self.consumer.commit(&to_rdkafka_list(offsets)?, mode)?),
            None => Ok(self.consumer.commit_consumer_state(mode)?),
        }
    }

    fn store_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        Ok(self.consumer.store_offset(topic, partition, offset)?)
    }

    fn seek(
        &self,
        topic: &str,
        partition: i32,
        offset: Offset,
        timeout: Duration,
    ) -> Result<(), BrokerError> {
        let offset = rdkafka::Offset::from_raw(offset.to_raw());
        Ok(self.consumer.seek(topic, partition, offset, timeout)?)
    }

    fn pause(&self, partitions: &TopicPartitionList) -> Result<(), BrokerError> {
        Ok(self.consumer.pause(&to_rdkafka_list(partitions)?)?)
    }

    fn resume(&self, partitions: &TopicPartitionList) -> Result<(), BrokerError> {
        Ok(self.consumer.resume(&to_rdkafka_list(partitions)?)?)
    }

    fn poll_one(&self, timeout: Duration) -> Option<Result<Self::Record<'_>, BrokerError>> {
        self.consumer
            .poll(timeout)
            .map(|result| result.map_err(BrokerError::from))
    }

    fn close(self) {
        // Dropping the consumer leaves the group and destroys the librdkafka handle.
        info!("closing Kafka consumer");
        drop(self.consumer);
    }
}
