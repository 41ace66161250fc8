use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "false")]
    pub kafka_verify_ssl_certificate: bool,

    pub kafka_consumer_group: String,

    // We default to "earliest" so a new group reads what is already retained
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Offsets are committed explicitly by default, after a batch has been handled
    #[envconfig(default = "false")]
    pub kafka_consumer_auto_commit: bool,

    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    // When false, offsets are only stored through `Consumer::store_offset`
    #[envconfig(default = "true")]
    pub kafka_consumer_auto_offset_store: bool,

    #[envconfig(default = "30000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "10000")]
    pub kafka_statistics_interval_ms: u32,
}

impl From<&KafkaConfig> for ClientConfig {
    fn from(config: &KafkaConfig) -> Self {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set(
                "enable.auto.commit",
                config.kafka_consumer_auto_commit.to_string(),
            )
            .set(
                "auto.commit.interval.ms",
                config.kafka_consumer_auto_commit_interval_ms.to_string(),
            )
            .set(
                "session.timeout.ms",
                config.kafka_session_timeout_ms.to_string(),
            )
            .set(
                "statistics.interval.ms",
                config.kafka_statistics_interval_ms.to_string(),
            )
            .set(
                "enable.auto.offset.store",
                config.kafka_consumer_auto_offset_store.to_string(),
            )
            .set("enable.partition.eof", "false");

        if config.kafka_tls {
            client_config.set("security.protocol", "ssl").set(
                "enable.ssl.certificate.verification",
                config.kafka_verify_ssl_certificate.to_string(),
            );
        };

        client_config
    }
}
