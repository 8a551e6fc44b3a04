//! Unified logging module for gateway services
//!
//! Installs a `tracing-subscriber` registry whose `EnvFilter` sits behind a
//! `reload` layer, so the filter can be changed at runtime (debug toggle
//! from the HTTP surface). File output and rotation are left to the host.

use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

/// Target used for HTTP access logs
pub const API_ACCESS_TARGET: &str = "api_access";

// Dynamic log level reload support
type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();
static INITIAL_FILTER: OnceLock<String> = OnceLock::new();

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name (e.g., "mbsrv"), used as the crate-level filter target
    pub service_name: String,
    /// Base level when `RUST_LOG` is not set
    pub level: Level,
    /// Enable JSON format for structured logging
    pub enable_json: bool,
    /// Log HTTP access lines (`api_access` target)
    pub enable_api_log: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            level: Level::INFO,
            enable_json: false,
            enable_api_log: true,
        }
    }
}

/// Build the initial filter string.
///
/// `RUST_LOG` wins when set; `api_access` is appended unless the user already
/// mentions it.
fn initial_filter(config: &LogConfig) -> String {
    let api_level = if config.enable_api_log { "info" } else { "off" };
    match std::env::var("RUST_LOG") {
        Ok(env_str) if env_str.contains(API_ACCESS_TARGET) => env_str,
        Ok(env_str) => format!("{},{}={}", env_str, API_ACCESS_TARGET, api_level),
        Err(_) => format!(
            "{},{}={}",
            config.level.as_str().to_lowercase(),
            API_ACCESS_TARGET,
            api_level
        ),
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter_str = initial_filter(&config);
    let env_filter = EnvFilter::try_new(&filter_str)?;

    // Wrap EnvFilter with reload::Layer for dynamic level changes
    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);

    let registry = tracing_subscriber::registry().with(reload_filter);
    if config.enable_json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(false).with_ansi(true))
            .try_init()?;
    }

    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    let _ = INITIAL_FILTER.set(filter_str.clone());
    let current = CURRENT_LOG_LEVEL.get_or_init(|| Mutex::new(String::new()));
    if let Ok(mut guard) = current.lock() {
        *guard = filter_str;
    }

    tracing::info!("Logging: {} @ {}", config.service_name, get_log_level());
    Ok(())
}

/// Dynamically set log filter level at runtime
///
/// # Arguments
/// * `level` - Log level string (e.g., "debug", "info") or a full filter directive
///   (e.g., "info,mbsrv=debug")
///
/// # Example
/// ```ignore
/// common::logging::set_log_level("debug")?;
/// ```
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Restore the filter installed by [`init_with_config`], `RUST_LOG` included
pub fn reset_log_level() -> Result<(), String> {
    let initial = INITIAL_FILTER
        .get()
        .ok_or("Logging not initialized with reload support")?;
    set_log_level(initial)
}

/// Get current log filter level
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Axum middleware writing one access line per request to the `api_access` target
///
/// Modifying methods are logged at INFO, reads at DEBUG.
///
/// ```rust,ignore
/// let app = Router::new()
///     // ... routes ...
///     .layer(middleware::from_fn(common::logging::http_request_logger))
///     .with_state(state);
/// ```
#[cfg(feature = "axum")]
pub async fn http_request_logger(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    use std::time::Instant;

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;
    let duration_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE") {
        tracing::info!(
            target: "api_access",
            method = %method,
            path = %path,
            status,
            duration_ms,
            "HTTP request"
        );
    } else {
        tracing::debug!(
            target: "api_access",
            method = %method,
            path = %path,
            status,
            duration_ms,
            "HTTP request"
        );
    }
    response
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_initial_filter_appends_api_target() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LogConfig {
            service_name: "mbsrv".into(),
            level: Level::DEBUG,
            ..Default::default()
        };
        assert_eq!(initial_filter(&config), "debug,api_access=info");
    }

    #[test]
    fn test_initial_filter_api_disabled() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LogConfig {
            enable_api_log: false,
            ..Default::default()
        };
        assert_eq!(initial_filter(&config), "info,api_access=off");
    }

    #[test]
    fn test_set_level_rejects_garbage_directive() {
        // Either logging is not initialized or the directive is invalid; both are errors
        assert!(set_log_level("info,=[").is_err());
    }

    #[test]
    fn test_reset_restores_initial_filter() {
        assert!(reset_log_level().is_err());

        let config = LogConfig {
            service_name: "mbsrv".into(),
            level: Level::WARN,
            ..Default::default()
        };
        let initial = initial_filter(&config);
        init_with_config(config).unwrap();
        assert_eq!(get_log_level(), initial);

        set_log_level("debug").unwrap();
        assert_eq!(get_log_level(), "debug");
        reset_log_level().unwrap();
        assert_eq!(get_log_level(), initial);
    }
}
