use log::{debug, info, log_enabled, Level};

/// Initializes the logger with the `env_logger` crate.
///
/// The level comes from `RUST_LOG`; without it only warnings and errors are
/// shown. Calling this more than once is harmless.
pub fn init_logger() {
    init_logger_with_default("warn");
}

/// Like [`init_logger`], but with a caller-chosen level when `RUST_LOG` is
/// unset (the CLI maps `-v` flags onto this).
pub fn init_logger_with_default(default_filter: &str) {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    if env_logger::Builder::from_env(env).try_init().is_err() {
        debug!("Logger already initialized");
    }
}

/// Logs an informational message.
pub fn log_info(message: &str) {
    if log_enabled!(Level::Info) {
        info!("{message}");
    }
}
