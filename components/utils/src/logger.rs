use serde::{Deserialize, Serialize};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{filter, fmt::Layer, layer::SubscriberExt, prelude::*, EnvFilter, Registry};

pub const DEFAULT_LOG_DIR: &str = "/tmp/tansu.logs";

const DEFAULT_LOG_TARGETS: &str = "info";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    pub dir: String,
    pub level: Option<String>,
    pub append_stdout: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            dir: DEFAULT_LOG_DIR.to_string(),
            level: None,
            append_stdout: true,
        }
    }
}

pub fn init_global_logging(app_name: &str, opts: &LoggingOptions) -> Vec<WorkerGuard> {
    let mut guards = vec![];

    let stdout_logging_layer = if opts.append_stdout {
        let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(stdout_guard);
        Some(Layer::new().with_writer(stdout_writer))
    } else {
        None
    };

    let rolling_appender = RollingFileAppender::new(Rotation::HOURLY, &opts.dir, app_name);
    let (rolling_writer, rolling_guard) = tracing_appender::non_blocking(rolling_appender);
    let file_logging_layer = Layer::new().with_writer(rolling_writer);
    guards.push(rolling_guard);

    let err_rolling_appender =
        RollingFileAppender::new(Rotation::HOURLY, &opts.dir, format!("{}-err", app_name));
    let (err_rolling_writer, err_rolling_guard) =
        tracing_appender::non_blocking(err_rolling_appender);
    let err_file_logging_layer = Layer::new().with_writer(err_rolling_writer);
    guards.push(err_rolling_guard);

    // Resolve the log level from options, then RUST_LOG, then defaults.
    let rust_log_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let targets_string = opts
        .level
        .as_deref()
        .or(rust_log_env.as_deref())
        .unwrap_or(DEFAULT_LOG_TARGETS);
    let target_filter = targets_string
        .parse::<filter::Targets>()
        .expect("error parsing log level string");

    let subscriber = Registry::default()
        .with(target_filter)
        .with(stdout_logging_layer)
        .with(file_logging_layer)
        .with(err_file_logging_layer.with_filter(filter::LevelFilter::ERROR));

    tracing::subscriber::set_global_default(subscriber)
        .expect("error setting global tracing subscriber");

    guards
}

/// Pretty stdout logging for tests and tools. Safe to call more than
/// once; only the first call installs the subscriber.
pub fn install_fmt_log() {
    let stdout_log = tracing_subscriber::fmt::layer().pretty();
    let subscriber = Registry::default().with(stdout_log);
    let _ = tracing::subscriber::set_global_default(subscriber);
}
