//! Error types for wxflow operations
//!
//! Every failure in the request/cache/pipeline core is recovered locally by
//! the component that detects it. These types exist so that the recovering
//! component can log a precise reason and so that callers who want the reason
//! (tests, diagnostics) can inspect it.

use thiserror::Error;

/// Request key construction and lookup errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestKeyError {
    #[error("Request key not found: {key}")]
    NotFound { key: String },

    #[error("Invalid value for request key {key}: {value} - {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Malformed request string at field {field:?}: {reason}")]
    Malformed { field: String, reason: String },
}

/// Resource cache (memory manager) errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache {cache}: key {key} is already occupied")]
    KeyCollision { cache: String, key: String },

    #[error("Cache {cache}: no entry for key {key}")]
    NotAvailable { cache: String, key: String },

    #[error("Cache {cache}: key {key} released more often than acquired")]
    OverRelease { cache: String, key: String },

    #[error(
        "Cache {cache}: memory limit exceeded, item needs {required_kb} kb, \
         usage is {usage_kb} kb of {limit_kb} kb after evicting all released items"
    )]
    EvictionFailure {
        cache: String,
        required_kb: u64,
        usage_kb: u64,
        limit_kb: u64,
    },

    #[error("Cache {cache}: lock poisoned")]
    LockPoisoned { cache: String },
}

/// Data source errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Request {request} for source {source_name} is missing required keys: {missing:?}")]
    MissingKeys {
        source_name: String,
        request: String,
        missing: Vec<String>,
    },

    #[error("Source {source_name} has no data available for request {request}")]
    NotAvailable { source_name: String, request: String },

    #[error("Source {source_name} has no input source registered under prefix {prefix:?}")]
    NoInput { source_name: String, prefix: String },

    #[error("Source {source_name} failed to produce data for request {request}: {reason}")]
    ProductionFailed {
        source_name: String,
        request: String,
        reason: String,
    },

    #[error("Scheduler {scheduler} is unavailable: {reason}")]
    SchedulerUnavailable { scheduler: String, reason: String },

    #[error("Source registry lock poisoned")]
    RegistryPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Failed to install tracing subscriber: {reason}")]
    SubscriberInit { reason: String },
}

/// Master error type for all wxflow errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WxflowError {
    #[error("Request key error: {0}")]
    RequestKey(#[from] RequestKeyError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for wxflow operations.
pub type WxflowResult<T> = Result<T, WxflowError>;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_error_display_not_found() {
        let err = RequestKeyError::NotFound {
            key: "VALID_TIME".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("not found"));
        assert!(msg.contains("VALID_TIME"));
    }

    #[test]
    fn test_eviction_failure_display_carries_sizes() {
        let err = CacheError::EvictionFailure {
            cache: "NWP".to_string(),
            required_kb: 512,
            usage_kb: 900,
            limit_kb: 1024,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("512 kb"));
        assert!(msg.contains("1024 kb"));
        assert!(msg.contains("NWP"));
    }

    #[test]
    fn test_subscriber_init_display() {
        let err = ConfigError::SubscriberInit {
            reason: "a global default trace dispatcher has already been set".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.starts_with("Failed to install tracing subscriber"));
        assert!(msg.contains("already been set"));
    }

    #[test]
    fn test_missing_keys_lists_keys() {
        let err = SourceError::MissingKeys {
            source_name: "grid-reader".to_string(),
            request: "VARIABLE=T;".to_string(),
            missing: vec!["INIT_TIME".to_string(), "MEMBER".to_string()],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("INIT_TIME"));
        assert!(msg.contains("grid-reader"));
    }

    #[test]
    fn test_master_error_from_conversions() {
        let err: WxflowError = CacheError::LockPoisoned {
            cache: "GPU".to_string(),
        }
        .into();
        assert!(matches!(err, WxflowError::Cache(_)));

        let err: WxflowError = ConfigError::Parse {
            reason: "bad".to_string(),
        }
        .into();
        assert!(format!("{}", err).starts_with("Config error"));
    }
}
