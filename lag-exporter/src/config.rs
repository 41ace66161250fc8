use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use group_consumer::config::KafkaConfig;
use tracing::Level;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "9090")]
    pub port: u16,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: Level,

    #[envconfig(from = "KAFKA_TOPICS")]
    pub topics: TopicList,

    #[envconfig(default = "500")]
    pub batch_size: usize,

    #[envconfig(default = "1000")]
    pub batch_timeout: EnvMsDuration,

    #[envconfig(default = "250")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "200")]
    pub query_timeout: EnvMsDuration,

    #[envconfig(default = "100")]
    pub watermark_timeout: EnvMsDuration,

    #[envconfig(default = "20000")]
    pub lag_check_interval: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A comma separated list of topic names, with at least one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicList(pub Vec<String>);

#[derive(Debug, PartialEq, Eq)]
pub struct TopicListIsEmptyError;

impl FromStr for TopicList {
    type Err = TopicListIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let topics: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_owned)
            .collect();

        if topics.is_empty() {
            Err(TopicListIsEmptyError)
        } else {
            Ok(TopicList(topics))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_topic_list() {
        assert_eq!(
            "orders, payments,,refunds ".parse::<TopicList>(),
            Ok(TopicList(vec![
                "orders".to_owned(),
                "payments".to_owned(),
                "refunds".to_owned()
            ]))
        );
        assert_eq!(" , ".parse::<TopicList>(), Err(TopicListIsEmptyError));
    }

    #[test]
    fn parse_ms_duration() {
        let duration: EnvMsDuration = "1500".parse().expect("valid duration");
        assert_eq!(duration.0, time::Duration::from_millis(1500));
        assert!("-1".parse::<EnvMsDuration>().is_err());
    }

    #[test]
    fn init_from_hashmap() {
        let env = std::collections::HashMap::from([
            ("KAFKA_TOPICS".to_owned(), "orders,payments".to_owned()),
            ("KAFKA_CONSUMER_GROUP".to_owned(), "billing".to_owned()),
            ("LOG_LEVEL".to_owned(), "debug".to_owned()),
        ]);
        let config = Config::init_from_hashmap(&env).expect("failed to load config");

        assert_eq!(config.bind(), "0.0.0.0:9090");
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.topics.0, vec!["orders", "payments"]);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.lag_check_interval.0, time::Duration::from_secs(20));
        assert_eq!(config.kafka.kafka_consumer_group, "billing");
        assert_eq!(config.kafka.kafka_hosts, "localhost:9092");
        assert!(!crate::ExporterSettings::from(&config).explicit_offset_store);
    }
}
