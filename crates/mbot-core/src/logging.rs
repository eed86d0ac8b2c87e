use crate::{errors::Error, Result};

/// Initialize tracing for the bot.
///
/// Default: info for our crates, warn for everything else. Can be overridden with
/// `RUST_LOG`. Authorization channel transitions are logged at debug level and only when
/// [`BotConfig::auth_debug_logging`](crate::config::BotConfig::auth_debug_logging) is set.
pub fn init(service_name: &str) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,mbot_core=info,mbot_channels=info,{service_name}=info"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(true)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_reported_not_panicking() {
        init("mbot-test").unwrap();
        let err = init("mbot-test").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err:?}");
    }
}
