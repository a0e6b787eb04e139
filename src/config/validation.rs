//! Configuration validation.

use crate::config::Config;
use crate::listener::BindTarget;
use std::net::SocketAddr;

/// Validate the configuration.
///
/// Checks for:
/// - A bind address that parses as a TCP address or Unix socket path
/// - TLS and TCP keep-alive only on TCP binds
/// - Non-zero durations where zero makes no sense
/// - A known log level
/// - A metrics endpoint that does not collide with the served address
///
/// # Returns
///
/// `Ok(())` if valid, or every problem found joined with `; `.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();
    let server = &config.server;

    match BindTarget::parse(&server.bind) {
        Ok(target) => {
            if target.is_unix() && server.tls.is_some() {
                errors.push(format!("tls requires a TCP bind, got unix socket '{}'", server.bind));
            }

            let metrics = &config.global.metrics;
            if metrics.enabled && !target.is_unix() && same_tcp_address(&server.bind, metrics.address) {
                errors.push(format!(
                    "metrics address {} collides with server bind '{}'",
                    metrics.address, server.bind
                ));
            }
        }
        Err(e) => errors.push(e.to_string()),
    }

    if server.tcp_keepalive == Some(std::time::Duration::ZERO) {
        errors.push("tcp_keepalive must be greater than zero".to_string());
    }

    if server.shutdown_timeout == Some(std::time::Duration::ZERO) {
        errors.push("shutdown_timeout must be greater than zero".to_string());
    }

    if let Some(tls) = &server.tls {
        if tls.cert.as_os_str().is_empty() || tls.key.as_os_str().is_empty() {
            errors.push("tls requires both cert and key".to_string());
        }
    }

    if config.global.metrics.enabled && !config.global.metrics.path.starts_with('/') {
        errors.push(format!(
            "metrics path '{}' must start with '/'",
            config.global.metrics.path
        ));
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Whether `bind` names the same TCP endpoint as `addr`. Only literal
/// addresses are compared; host names are not resolved.
fn same_tcp_address(bind: &str, addr: SocketAddr) -> bool {
    let bind = match bind.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => bind.to_string(),
    };
    match bind.parse::<SocketAddr>() {
        Ok(bind) => bind.port() == addr.port() && (bind.ip() == addr.ip() || bind.ip().is_unspecified()),
        Err(_) => false,
    }
}
