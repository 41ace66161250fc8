pub mod config;
pub mod exporter;
pub mod liveness;
pub mod metrics;

pub use config::Config;
pub use exporter::{ExporterSettings, LagExporter};
