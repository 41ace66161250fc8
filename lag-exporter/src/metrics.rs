use axum::{routing::get, Router};
use group_consumer::metrics_consts::{BATCH_COLLECTION_DURATION_MS, BATCH_SIZE};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::liveness::LivenessRegistry;

pub const METRIC_CONSUMER_LAG: &str = "consumer_lag";
pub const METRIC_CONSUMER_TIMESTAMP: &str = "consumer_last_message_timestamp";
pub const METRIC_LAG_CHECK_ERRORS: &str = "consumer_lag_check_errors_total";
pub const METRIC_COMMIT_ERRORS: &str = "consumer_commit_errors_total";

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

/// Build the Router exposing `/metrics` and `/_liveness`.
pub fn setup_router(recorder_handle: PrometheusHandle, liveness: LivenessRegistry) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BATCH_SIZES: &[f64] = &[1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0];
    const BATCH_DURATIONS_MS: &[f64] = &[
        5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(BATCH_SIZE.to_owned()), BATCH_SIZES)?
        .set_buckets_for_metric(
            Matcher::Full(BATCH_COLLECTION_DURATION_MS.to_owned()),
            BATCH_DURATIONS_MS,
        )?
        .install_recorder()
}

/// Register all metrics with descriptions
pub fn register_metrics() {
    describe_gauge!(
        METRIC_CONSUMER_LAG,
        "Number of messages behind for the consumer group"
    );
    describe_gauge!(
        METRIC_CONSUMER_TIMESTAMP,
        "Timestamp of the last message consumed by the consumer group"
    );
    describe_counter!(
        METRIC_LAG_CHECK_ERRORS,
        "Lag checks that could not be completed"
    );
    describe_counter!(METRIC_COMMIT_ERRORS, "Offset commits that failed");
    describe_histogram!(BATCH_SIZE, "Messages per consumed batch");
    describe_histogram!(
        BATCH_COLLECTION_DURATION_MS,
        "Time spent collecting one batch, in milliseconds"
    );
}

/// Record the consumer lag count metric
pub fn record_lag_count(topic: &str, partition: i32, consumergroup: &str, lag: i64) {
    gauge!(METRIC_CONSUMER_LAG,
        "topic" => topic.to_owned(),
        "partition" => partition.to_string(),
        "consumergroup" => consumergroup.to_owned(),
    )
    .set(lag as f64);
}

/// Record the timestamp of the last consumed message, in milliseconds
pub fn record_timestamp(topic: &str, partition: i32, consumergroup: &str, timestamp: i64) {
    gauge!(METRIC_CONSUMER_TIMESTAMP,
        "topic" => topic.to_owned(),
        "partition" => partition.to_string(),
        "consumergroup" => consumergroup.to_owned(),
    )
    .set(timestamp as f64);
}
