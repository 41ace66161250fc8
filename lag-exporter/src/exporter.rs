use std::collections::HashMap;
use std::time::{Duration, Instant};

use group_consumer::{
    CommitMode, Consumer, ConsumerError, Engine, Lag, Message, StopHandle, TopicPartitionList,
};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::liveness::LivenessHandle;
use crate::metrics::{
    record_lag_count, record_timestamp, METRIC_COMMIT_ERRORS, METRIC_LAG_CHECK_ERRORS,
};

#[derive(Debug, Clone)]
pub struct ExporterSettings {
    pub topics: Vec<String>,
    pub consumer_group: String,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub query_timeout: Duration,
    pub watermark_timeout: Duration,
    pub lag_check_interval: Duration,
    /// Store consumed offsets by hand, for engines that do not store them on delivery.
    pub explicit_offset_store: bool,
}

impl From<&Config> for ExporterSettings {
    fn from(config: &Config) -> Self {
        Self {
            topics: config.topics.0.clone(),
            consumer_group: config.kafka.kafka_consumer_group.clone(),
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout.0,
            query_timeout: config.query_timeout.0,
            watermark_timeout: config.watermark_timeout.0,
            lag_check_interval: config.lag_check_interval.0,
            explicit_offset_store: !config.kafka.kafka_consumer_auto_offset_store,
        }
    }
}

/// Consumes the configured topics in batches, commits progress after every
/// batch, and periodically publishes the group's lag.
pub struct LagExporter<E: Engine> {
    consumer: Consumer<E>,
    settings: ExporterSettings,
    liveness: LivenessHandle,
    last_lag_check: Option<Instant>,
}

impl<E: Engine> LagExporter<E> {
    pub fn new(
        consumer: Consumer<E>,
        settings: ExporterSettings,
        liveness: LivenessHandle,
    ) -> Result<Self, ConsumerError> {
        consumer.subscribe(&settings.topics)?;
        info!(
            "subscribed to {:?} as {}",
            settings.topics, settings.consumer_group
        );

        Ok(Self {
            consumer,
            settings,
            liveness,
            last_lag_check: None,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.consumer.stop_handle()
    }

    /// Run until stopped. Only a failed poll ends the loop early.
    pub fn run(mut self) -> Result<(), ConsumerError> {
        let result = loop {
            if !self.consumer.running() {
                break Ok(());
            }
            self.liveness.report_healthy();

            if let Err(err) = self.consume_batch() {
                break Err(err);
            }
            if self.lag_check_due() {
                self.report_lag();
            }
        };

        info!("consumer loop stopped, committing final offsets");
        if let Err(err) = self.consumer.commit(None, CommitMode::Sync) {
            // Nothing stored since the last commit is not a failure
            debug!("final commit skipped: {}", err);
        }
        self.consumer.close();
        result
    }

    /// Poll one batch, record it and commit the consumed offsets. Returns the
    /// number of messages consumed.
    pub fn consume_batch(&mut self) -> Result<usize, ConsumerError> {
        let batch = self
            .consumer
            .poll_batch(self.settings.batch_size, self.settings.batch_timeout)?;
        if batch.is_empty() {
            return Ok(0);
        }

        // Batches are in delivery order, so the last message per partition wins.
        let mut latest: HashMap<(&str, i32), &Message> = HashMap::new();
        for message in &batch {
            latest.insert((message.topic(), message.partition()), message);
        }

        for ((topic, partition), message) in &latest {
            if let Some(timestamp) = message.timestamp() {
                let millis = timestamp.unix_timestamp_nanos() / 1_000_000;
                record_timestamp(
                    topic,
                    *partition,
                    &self.settings.consumer_group,
                    i64::try_from(millis).unwrap_or(i64::MAX),
                );
            }
            if !self.settings.explicit_offset_store {
                continue;
            }
            if let Err(err) = self.consumer.store_offset(message) {
                counter!(METRIC_COMMIT_ERRORS).increment(1);
                warn!("failed to store offset for {}/{}: {}", topic, partition, err);
            }
        }

        if let Err(err) = self.consumer.commit(None, CommitMode::Async) {
            counter!(METRIC_COMMIT_ERRORS).increment(1);
            warn!("failed to commit offsets: {}", err);
        }

        debug!("consumed batch of {} messages", batch.len());
        Ok(batch.len())
    }

    fn lag_check_due(&self) -> bool {
        self.last_lag_check
            .map_or(true, |last| last.elapsed() >= self.settings.lag_check_interval)
    }

    /// Publish the lag of every assigned partition with a committed offset.
    /// Failures are counted and logged; `None` means nothing was reported.
    pub fn report_lag(&mut self) -> Option<Lag> {
        self.last_lag_check = Some(Instant::now());

        let committed = match self.consumer.committed(None, self.settings.query_timeout) {
            Ok(committed) => committed,
            Err(err) => {
                counter!(METRIC_LAG_CHECK_ERRORS).increment(1);
                warn!("failed to fetch committed offsets: {}", err);
                return None;
            }
        };

        let committed: TopicPartitionList = committed
            .iter()
            .filter(|entry| entry.offset.is_real())
            .cloned()
            .collect();
        if committed.is_empty() {
            debug!("no committed offsets to check lag for");
            return None;
        }

        match self
            .consumer
            .lag(&committed, self.settings.watermark_timeout)
        {
            Ok(lag) => {
                for (topic, partitions) in &lag {
                    for (partition, lag) in partitions {
                        info!(
                            "Topic: {}, Partition: {}, Lag: {}",
                            topic, partition, lag
                        );
                        record_lag_count(topic, *partition, &self.settings.consumer_group, *lag);
                    }
                }
                Some(lag)
            }
            Err(err) => {
                counter!(METRIC_LAG_CHECK_ERRORS).increment(1);
                warn!("failed to compute lag: {}", err);
                None
            }
        }
    }
}
