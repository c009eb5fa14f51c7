use tracing_subscriber::{fmt, EnvFilter};

/// Output shape for the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines for terminals.
    Human,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies (e.g.
/// "info" or "pf_admission=debug,warn"). Calling this again — tests do —
/// is a no-op rather than an error.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    match format {
        LogFormat::Human => builder.try_init().ok(),
        LogFormat::Json => builder.json().try_init().ok(),
    };

    tracing::info!(service = service_name, ?format, "logging initialised");
}

/// Human-readable logging, the default for interactive use.
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Human);
}

/// JSON logging for deployments behind a log shipper.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Json);
}
