use anyhow::{Context, Result};
use envconfig::Envconfig;
use group_consumer::{Consumer, KafkaEngine};
use tokio::signal::unix::SignalKind;
use tracing::{error, info};

use lag_exporter::config::Config;
use lag_exporter::liveness::LivenessRegistry;
use lag_exporter::metrics::{register_metrics, serve, setup_metrics_recorder, setup_router};
use lag_exporter::{ExporterSettings, LagExporter};

async fn wait_for_shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().context("failed to load configuration from env")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    let recorder_handle = setup_metrics_recorder().context("failed to install metrics recorder")?;
    register_metrics();

    let liveness = LivenessRegistry::new();
    let consumer_liveness = liveness.register(
        "consumer",
        time::Duration::try_from(config.liveness_deadline.0)
            .context("liveness deadline out of range")?,
    );

    let engine = KafkaEngine::new(&config.kafka).context("failed to create Kafka consumer")?;
    let consumer = Consumer::new(engine).with_poll_interval(config.poll_interval.0);
    let exporter = LagExporter::new(consumer, ExporterSettings::from(&config), consumer_liveness)
        .context("failed to subscribe to topics")?;
    let stop_handle = exporter.stop_handle();

    // The consumer blocks while polling, keep it off the async workers.
    let mut consumer_task = tokio::task::spawn_blocking(move || exporter.run());

    let router = setup_router(recorder_handle, liveness);
    let bind = config.bind();
    info!("serving metrics on {}", bind);

    tokio::select! {
        result = &mut consumer_task => {
            return result
                .context("consumer task panicked")?
                .context("consumer loop failed");
        }
        result = serve(router, &bind) => {
            if let Err(err) = result {
                error!("failed to serve metrics on {}: {}", bind, err);
            }
        }
        result = wait_for_shutdown_signal() => result?,
    }

    stop_handle.stop();
    consumer_task
        .await
        .context("consumer task panicked")?
        .context("consumer loop failed")?;
    info!("consumer stopped, exiting");
    Ok(())
}
