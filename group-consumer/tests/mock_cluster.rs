use std::time::{Duration, Instant};

use group_consumer::config::KafkaConfig;
use group_consumer::{CommitMode, Consumer, KafkaEngine, Offset, TopicPartitionList};
use rdkafka::mocking::MockCluster;
use rdkafka::producer::{BaseProducer, BaseRecord, DefaultProducerContext, Producer};
use rdkafka::ClientConfig;

const TOPIC: &str = "orders";

fn start_mock_cluster() -> (MockCluster<'static, DefaultProducerContext>, BaseProducer) {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");
    cluster
        .create_topic(TOPIC, 2, 1)
        .expect("failed to create topic");

    let producer: BaseProducer = ClientConfig::new()
        .set("bootstrap.servers", cluster.bootstrap_servers())
        .set("linger.ms", "0")
        .create()
        .expect("failed to create producer");
    (cluster, producer)
}

fn produce(producer: &BaseProducer, partition: i32, payloads: &[&str]) {
    for payload in payloads {
        producer
            .send(
                BaseRecord::to(TOPIC)
                    .partition(partition)
                    .key("customer-1")
                    .payload(*payload),
            )
            .map_err(|(err, _)| err)
            .expect("failed to enqueue message");
    }
    producer
        .flush(Duration::from_secs(5))
        .expect("failed to flush producer");
}

fn consumer_for(cluster: &MockCluster<'static, DefaultProducerContext>) -> Consumer<KafkaEngine> {
    let config = KafkaConfig {
        kafka_hosts: cluster.bootstrap_servers(),
        kafka_tls: false,
        kafka_verify_ssl_certificate: false,
        kafka_consumer_group: "group-consumer-tests".to_owned(),
        kafka_consumer_offset_reset: "earliest".to_owned(),
        kafka_consumer_auto_commit: false,
        kafka_consumer_auto_commit_interval_ms: 5000,
        kafka_consumer_auto_offset_store: true,
        kafka_session_timeout_ms: 6000,
        kafka_statistics_interval_ms: 1000,
    };
    let engine = KafkaEngine::new(&config).expect("failed to create engine");
    Consumer::new(engine).with_poll_interval(Duration::from_millis(100))
}

/// The mock brokers take a moment to elect leaders, so queries are retried.
fn retry<T, E>(mut f: impl FnMut() -> Result<T, E>) -> T
where
    E: std::fmt::Debug,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match f() {
            Ok(value) => return value,
            Err(err) if Instant::now() > deadline => panic!("gave up retrying: {:?}", err),
            Err(_) => std::thread::sleep(Duration::from_millis(100)),
        }
    }
}

#[test]
fn consumes_and_commits_against_mock_cluster() {
    let (cluster, producer) = start_mock_cluster();
    let mut consumer = consumer_for(&cluster);

    assert_eq!(
        retry(|| consumer.query_watermark_offsets(TOPIC, 0, Duration::from_secs(1))),
        (0, 0)
    );
    produce(&producer, 0, &["one", "two", "three"]);
    assert_eq!(
        retry(|| consumer.query_watermark_offsets(TOPIC, 0, Duration::from_secs(1))),
        (0, 3)
    );

    let mut assignment = TopicPartitionList::new();
    assignment.add_partition_offset(TOPIC, 0, Offset::Beginning);
    consumer.assign(&assignment).expect("failed to assign");

    let mut messages = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while messages.len() < 3 && Instant::now() < deadline {
        messages.extend(
            consumer
                .poll_batch(3 - messages.len(), Duration::from_millis(500))
                .expect("failed to poll batch"),
        );
    }
    let payloads: Vec<&str> = messages.iter().filter_map(|m| m.payload_str()).collect();
    assert_eq!(payloads, vec!["one", "two", "three"]);
    assert_eq!(messages[0].key(), Some(&b"customer-1"[..]));
    assert!(messages[0].timestamp().is_some());

    let mut offsets = TopicPartitionList::new();
    offsets.add_partition_offset(TOPIC, 0, Offset::At(2));
    retry(|| consumer.commit(Some(&offsets), CommitMode::Sync));

    let committed = retry(|| consumer.committed(None, Duration::from_secs(1)));
    assert_eq!(
        committed.find_partition(TOPIC, 0).map(|e| e.offset),
        Some(Offset::At(2))
    );

    let lag = consumer
        .lag(&committed, Duration::from_secs(1))
        .expect("failed to compute lag");
    assert_eq!(lag[TOPIC][&0], 1);

    consumer.close();
    assert!(!consumer.running());
}

#[test]
fn subscription_is_reported_by_librdkafka() {
    let (cluster, _producer) = start_mock_cluster();
    let consumer = consumer_for(&cluster);

    consumer.subscribe([TOPIC]).expect("failed to subscribe");
    let subscription = consumer.subscription().expect("failed to read subscription");
    assert_eq!(subscription.topics(), vec![TOPIC]);
    assert!(subscription.has_unassigned());

    let mut partitions = TopicPartitionList::new();
    partitions.add_partition(TOPIC, 1);
    let committed = retry(|| consumer.committed(Some(&partitions), Duration::from_secs(1)));
    assert_eq!(
        committed.find_partition(TOPIC, 1).map(|e| e.offset),
        Some(Offset::Unset)
    );
}
