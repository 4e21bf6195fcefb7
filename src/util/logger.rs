use log::SetLoggerError;

/// Environment variable holding the log filter, e.g. `GENCON_LOG=gencon::concurrent=debug`.
pub const LOG_FILTER_ENV: &str = "GENCON_LOG";
/// Environment variable controlling colored output (`auto`, `always` or `never`).
pub const LOG_STYLE_ENV: &str = "GENCON_LOG_STYLE";

/// Attempt to init an env_logger for the collector. The filter is read from `GENCON_LOG`,
/// falling back to `info`.
///
/// Does nothing if the "builtin_env_logger" feature is disabled, in which case the embedding
/// runtime is expected to install its own `log` implementation.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let env = env_logger::Env::new()
                .filter_or(LOG_FILTER_ENV, "info")
                .write_style(LOG_STYLE_ENV);
            env_logger::Builder::from_env(env)
                .format_timestamp_millis()
                .try_init()
        } else {
            Ok(())
        }
    }
}
