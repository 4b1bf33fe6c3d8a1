//! Logging setup.
//!
//! Logs go to stdout through a compact `fmt` layer. By default only
//! this crate's events at "ERROR" and above are shown; pass a level
//! to [`setup`], or set `STATEKEEPER_LOG` to any `EnvFilter`
//! directive string to take full control.
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::ConfigError;

/// Environment variable holding `EnvFilter` directives.
pub const LOG_ENV: &str = "STATEKEEPER_LOG";

fn get_log_level(level: Option<&str>) -> Result<LevelFilter, ConfigError> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(ConfigError::Invalid(format!("wrong log level: {level}"))),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

/// Install the global logging subscriber.
///
/// Calling this more than once only logs a warning.
pub fn setup(log_level: Option<&str>) -> Result<(), ConfigError> {
    let log_level = get_log_level(log_level)?;

    let fmt_layer = || {
        tracing_subscriber::fmt::Layer::default()
            .compact()
            // Show source file
            .with_file(true)
            // Display source code line numbers
            .with_line_number(true)
            // Display the thread ID an event was recorded on
            .with_thread_ids(true)
    };

    let logs: Box<dyn Layer<Registry> + Send + Sync> = match EnvFilter::try_from_env(LOG_ENV) {
        Ok(filter) => Box::new(fmt_layer().with_filter(filter)),
        Err(_) => Box::new(
            fmt_layer().with_filter(Targets::new().with_target("statekeeper", log_level)),
        ),
    };
    set_global_subscriber(Registry::default().with(logs));
    Ok(())
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if logging was already initialized, which happens
    // when several coordinators are set up in one process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn setup_twice_is_fine() {
    setup(Some("info")).unwrap();
    setup(Some("info")).unwrap();
}
