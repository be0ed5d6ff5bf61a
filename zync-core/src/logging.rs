//! Tracing setup for the `zync` binary

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

const OWN_TARGETS: [&str; 3] = ["zync", "zync_core", "zync_relay"];

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Lines go to `file_path` when
/// set, otherwise to stderr.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directives(&config.level)?)?,
    };

    let (writer, ansi) = match &config.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let layer = if config.format == "json" {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_file(false)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry().with(filter).with(layer).try_init()?;
    Ok(())
}

/// Filter directives: the configured level for our own crates, `warn` for
/// dependencies
fn directives(level: &str) -> anyhow::Result<String> {
    let level = match level.to_lowercase().as_str() {
        "warning" => Level::WARN,
        other => other
            .parse::<Level>()
            .map_err(|_| anyhow::anyhow!("Invalid log level: {level}"))?,
    };
    let level = level.as_str().to_lowercase();

    let mut directives = vec!["warn".to_string()];
    directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={level}")));
    Ok(directives.join(","))
}
