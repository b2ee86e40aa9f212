use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global `tracing` subscriber. Called once from `main`; every
/// job/component below only ever calls into `tracing`'s macros, never
/// constructs its own subscriber.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = fmt().with_env_filter(filter).with_target(true);

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
