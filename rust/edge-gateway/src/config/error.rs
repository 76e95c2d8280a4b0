//! Configuration error types with actionable messages.

use std::fmt;

/// Configuration errors reported at startup.
///
/// Validation collects every problem it finds so operators can fix the
/// whole environment in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A configured value is present but unusable.
    Invalid {
        /// What is wrong.
        message: String,
        /// How to fix it.
        fix_hint: String,
    },
    /// A required setting is absent.
    MissingRequired {
        /// The missing setting name.
        setting: String,
        /// What needs it.
        context: String,
        /// Environment variable to set.
        env_var: String,
    },
    /// Multiple errors occurred.
    Multiple(Vec<ConfigurationError>),
}

impl std::error::Error for ConfigurationError {}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { message, fix_hint } => {
                write!(f, "Invalid configuration: {message}\n\nHow to fix: {fix_hint}")
            }
            Self::MissingRequired {
                setting,
                context,
                env_var,
            } => {
                write!(
                    f,
                    "Missing required configuration: {setting}\n\n\
                    Required for: {context}\n\
                    Set via: {env_var}"
                )
            }
            Self::Multiple(errors) => {
                writeln!(f, "Multiple configuration errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "\n{}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl ConfigurationError {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid(message: impl Into<String>, fix_hint: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }

    /// Create a missing required configuration error.
    #[must_use]
    pub fn missing_required(
        setting: impl Into<String>,
        context: impl Into<String>,
        env_var: impl Into<String>,
    ) -> Self {
        Self::MissingRequired {
            setting: setting.into(),
            context: context.into(),
            env_var: env_var.into(),
        }
    }

    /// Collapse a list of errors: none → `Ok`, one → itself, many → `Multiple`.
    pub fn collect(mut errors: Vec<ConfigurationError>) -> ConfigResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Environment variables named by every missing-key error.
    #[must_use]
    pub fn missing_env_vars(&self) -> Vec<&str> {
        match self {
            Self::MissingRequired { env_var, .. } => vec![env_var.as_str()],
            Self::Multiple(errors) => errors.iter().flat_map(Self::missing_env_vars).collect(),
            Self::Invalid { .. } => Vec::new(),
        }
    }

    /// Get the number of errors (1 for single errors, N for multiple).
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Multiple(errors) => errors.len(),
            _ => 1,
        }
    }
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigurationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_error_display() {
        let err = ConfigurationError::invalid(
            "PRIVATE_API_URL is not a valid URL: 'api'",
            "Use an absolute URL such as http://localhost:5000",
        );
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("PRIVATE_API_URL"));
        assert!(msg.contains("How to fix"));
    }

    #[test]
    fn test_missing_required_error_display() {
        let err = ConfigurationError::missing_required(
            "Gateway API key",
            "Authenticating service-to-service requests",
            "GATEWAY_API_KEY",
        );
        let msg = err.to_string();
        assert!(msg.contains("Missing required"));
        assert!(msg.contains("GATEWAY_API_KEY"));
    }

    #[test]
    fn test_collect_shapes() {
        assert!(ConfigurationError::collect(Vec::new()).is_ok());

        let single = ConfigurationError::collect(vec![ConfigurationError::invalid("a", "b")]);
        assert!(matches!(single, Err(ConfigurationError::Invalid { .. })));

        let many = ConfigurationError::collect(vec![
            ConfigurationError::missing_required("x", "y", "JWT_SECRET"),
            ConfigurationError::missing_required("x", "y", "ADMIN_PASSWORD"),
        ])
        .unwrap_err();
        assert_eq!(many.count(), 2);
        assert_eq!(many.missing_env_vars(), vec!["JWT_SECRET", "ADMIN_PASSWORD"]);
        assert!(many.to_string().contains("2."));
    }
}
