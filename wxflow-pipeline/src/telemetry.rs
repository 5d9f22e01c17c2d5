//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wxflow_core::{ConfigError, LogConfig, WxflowResult};

/// Build the filter: `RUST_LOG` if set, otherwise the configured directive.
pub fn env_filter(config: &LogConfig) -> WxflowResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter).map_err(|e| {
        ConfigError::InvalidValue {
            field: "log.filter".to_string(),
            value: config.filter.clone(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Install the global tracing subscriber.
///
/// Should be called once at application startup. Fails if the filter does not
/// parse or a global subscriber is already installed.
pub fn init_tracing(config: &LogConfig) -> WxflowResult<()> {
    let filter = env_filter(config)?;
    let json = config.json.then(|| tracing_subscriber::fmt::layer().json());
    let plain = (!config.json).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init()
        .map_err(|e| ConfigError::SubscriberInit {
            reason: e.to_string(),
        })?;

    tracing::info!(filter = %config.filter, json = config.json, "Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_config_error() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LogConfig {
            filter: "wxflow=notalevel".to_string(),
            json: false,
        };
        assert!(env_filter(&config).is_err());
    }

    #[test]
    fn test_second_init_fails() {
        let config = LogConfig::default();
        let _ = init_tracing(&config);
        assert!(matches!(
            init_tracing(&config),
            Err(wxflow_core::WxflowError::Config(ConfigError::SubscriberInit { .. }))
        ));
    }
}
