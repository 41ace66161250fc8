/// Counter for messages returned by `poll`, labelled by topic
pub const MESSAGES_POLLED: &str = "consumer_messages_polled_total";

/// Counter for deliveries the engine reported as failed
pub const POLL_ERRORS: &str = "consumer_poll_errors_total";

/// Histogram for the number of messages returned by `poll_batch`
pub const BATCH_SIZE: &str = "consumer_batch_size";

/// Histogram for the wall time spent collecting one batch
pub const BATCH_COLLECTION_DURATION_MS: &str = "consumer_batch_collection_duration_ms";

// ==== librdkafka statistics ====
pub const KAFKA_CALLBACK_QUEUE_DEPTH: &str = "consumer_kafka_callback_queue_depth";
pub const KAFKA_BROKER_RX_ERRORS: &str = "consumer_kafka_broker_rx_errors_total";
pub const KAFKA_BROKER_TX_ERRORS: &str = "consumer_kafka_broker_tx_errors_total";
pub const KAFKA_REBALANCES: &str = "consumer_kafka_rebalances_total";
pub const KAFKA_COMMIT_FAILURES: &str = "consumer_kafka_commit_failures_total";
