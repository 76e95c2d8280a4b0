//! Configuration validation for the edge gateway.
//!
//! The gateway refuses to start with an incomplete secret set. Every missing
//! key is reported at once so the operator can fix the environment in one
//! pass.

use super::error::{ConfigResult, ConfigurationError};
use super::AppConfig;
use crate::gateway::ip::is_valid_rule;

/// Minimum signing secret length accepted in production.
pub const MIN_PRODUCTION_SECRET_BYTES: usize = 32;

/// Configuration validator.
///
/// | Setting           | Required | Extra rule                               |
/// |-------------------|----------|------------------------------------------|
/// | `PRIVATE_API_URL` | yes      | absolute http(s) URL                     |
/// | `GATEWAY_API_KEY` | yes      |                                          |
/// | `ADMIN_PASSWORD`  | yes      | plaintext or `$argon2` PHC string        |
/// | `JWT_SECRET`      | yes      | at least 32 bytes in production          |
/// | rate limits       | no       | non-zero ceilings and window             |
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Self::missing_secrets(config);

        if let Some(url) = config.upstream.url.as_deref()
            && let Err(e) = Self::validate_upstream_url(url)
        {
            errors.push(e);
        }

        if config.deployment.is_production()
            && let Some(secret) = config.admin.jwt_secret.as_deref()
            && secret.len() < MIN_PRODUCTION_SECRET_BYTES
        {
            errors.push(ConfigurationError::invalid(
                format!(
                    "JWT_SECRET is {} bytes; production requires at least {MIN_PRODUCTION_SECRET_BYTES}",
                    secret.len()
                ),
                "Generate one with: openssl rand -hex 32",
            ));
        }

        if let Some(hash) = config.admin.password.as_deref()
            && hash.starts_with("$argon2")
            && argon2::PasswordHash::new(hash).is_err()
        {
            errors.push(ConfigurationError::invalid(
                "ADMIN_PASSWORD looks like an argon2 hash but does not parse",
                "Provide a full PHC string ($argon2id$v=19$...) or a plaintext password",
            ));
        }

        if let Err(e) = Self::validate_rate_limits(config) {
            errors.push(e);
        }

        for (name, list) in [
            ("ADMIN_IP_WHITELIST", &config.admin.ip_whitelist),
            ("CDN_IP_RANGES", &config.network.cdn_ranges),
            ("PLATFORM_IP_RANGES", &config.network.platform_ranges),
        ] {
            if !list.iter().all(|rule| is_valid_rule(rule)) {
                errors.push(ConfigurationError::invalid(
                    format!("{name} contains an entry that is neither an address nor an IPv4 CIDR"),
                    "Use comma-separated entries such as 127.0.0.1,10.0.0.0/8",
                ));
            }
        }

        ConfigurationError::collect(errors)
    }

    fn missing_secrets(config: &AppConfig) -> Vec<ConfigurationError> {
        let required = [
            (
                config.upstream.url.is_none(),
                "Private API URL",
                "Forwarding requests upstream",
                "PRIVATE_API_URL",
            ),
            (
                config.gateway.api_key.is_none(),
                "Gateway API key",
                "Authenticating service-to-service requests",
                "GATEWAY_API_KEY",
            ),
            (
                config.admin.password.is_none(),
                "Admin password",
                "Admin session login",
                "ADMIN_PASSWORD",
            ),
            (
                config.admin.jwt_secret.is_none(),
                "Session signing secret",
                "Issuing and verifying admin session tokens",
                "JWT_SECRET",
            ),
        ];

        required
            .into_iter()
            .filter(|(missing, ..)| *missing)
            .map(|(_, setting, context, env_var)| {
                ConfigurationError::missing_required(setting, context, env_var)
            })
            .collect()
    }

    /// The upstream must be an absolute http(s) URL.
    pub fn validate_upstream_url(raw: &str) -> ConfigResult<()> {
        match url::Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => Ok(()),
            Ok(url) => Err(ConfigurationError::invalid(
                format!("PRIVATE_API_URL has unsupported scheme '{}'", url.scheme()),
                "Use an http:// or https:// URL",
            )),
            Err(e) => Err(ConfigurationError::invalid(
                format!("PRIVATE_API_URL is not a valid URL: '{raw}' ({e})"),
                "Use an absolute URL such as http://localhost:5000",
            )),
        }
    }

    fn validate_rate_limits(config: &AppConfig) -> ConfigResult<()> {
        let limits = &config.rate_limit;
        if limits.window_secs == 0
            || limits.admin == 0
            || limits.frontend == 0
            || limits.public == 0
            || limits.burst_per_second == 0
        {
            return Err(ConfigurationError::invalid(
                "Rate limit ceilings and window must be greater than zero",
                "Check RATE_LIMIT_* and BURST_LIMIT_PER_SECOND",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;

    fn complete() -> AppConfig {
        let mut config = AppConfig::default();
        config.upstream.url = Some("http://localhost:5000".to_string());
        config.gateway.api_key = Some("service-key".to_string());
        config.admin.password = Some("hunter2".to_string());
        config.admin.jwt_secret = Some("short-dev-secret".to_string());
        config
    }

    #[test]
    fn test_complete_config_is_valid() {
        assert!(ConfigValidator::validate(&complete()).is_ok());
    }

    #[test]
    fn test_all_missing_keys_reported_together() {
        let err = ConfigValidator::validate(&AppConfig::default()).unwrap_err();
        assert_eq!(err.count(), 4);
        let vars = err.missing_env_vars();
        assert!(vars.contains(&"PRIVATE_API_URL"));
        assert!(vars.contains(&"GATEWAY_API_KEY"));
        assert!(vars.contains(&"ADMIN_PASSWORD"));
        assert!(vars.contains(&"JWT_SECRET"));
    }

    #[test]
    fn test_short_secret_rejected_in_production_only() {
        let mut config = complete();
        assert!(ConfigValidator::validate(&config).is_ok());

        config.deployment.environment = Environment::Production;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));

        config.admin.jwt_secret = Some("x".repeat(MIN_PRODUCTION_SECRET_BYTES));
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_upstream_url_must_be_http() {
        assert!(ConfigValidator::validate_upstream_url("https://api.internal:8443").is_ok());
        assert!(ConfigValidator::validate_upstream_url("ftp://api.internal").is_err());
        assert!(ConfigValidator::validate_upstream_url("api.internal").is_err());
    }

    #[test]
    fn test_malformed_ranges_rejected() {
        let mut config = complete();
        config.admin.ip_whitelist = vec!["127.0.0.1".to_string(), "10.0.0.0/40".to_string()];
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("ADMIN_IP_WHITELIST"));
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let mut config = complete();
        config.rate_limit.public = 0;
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
