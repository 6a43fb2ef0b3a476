use std::io;

use tracing::level_filters::LevelFilter;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::error::{Error, ErrorKind};

/// Component for initializing the `tracing` subsystem.
#[derive(Debug)]
pub struct Tracing {}

impl Tracing {
    /// Installs the global tracing subscriber, writing to stderr.
    ///
    /// The filter defaults to `INFO` and honors `RUST_LOG`.
    pub fn init() -> Result<Self, Error> {
        let env_filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy();

        // Configure log/tracing interoperability by setting a `LogTracer` as
        // the global logger for the log crate, which converts all log events
        // into tracing events.
        LogTracer::init().map_err(|e| ErrorKind::Init.context(e))?;

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_filter(env_filter);

        let subscriber = tracing_subscriber::registry().with(fmt_layer);

        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| ErrorKind::Init.context(e))?;

        Ok(Self {})
    }
}
