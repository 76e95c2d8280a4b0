//! Deployment environment and admission mode.
//!
//! - Development: verbose 401 responses, shield oracle fails open
//! - Production: silent redirects, shield oracle fails closed

use serde::{Deserialize, Serialize};

/// Deployment settings that change how failures are surfaced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Runtime environment.
    #[serde(default)]
    pub environment: Environment,
    /// How the admission filter treats shield decisions.
    #[serde(default)]
    pub admission_mode: AdmissionMode,
}

impl DeploymentConfig {
    /// Load deployment configuration from environment variables.
    pub fn from_env() -> Self {
        let environment = std::env::var("GATEWAY_ENV")
            .or_else(|_| std::env::var("NODE_ENV"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let admission_mode = std::env::var("ADMISSION_MODE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Self {
            environment,
            admission_mode,
        }
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self.environment, Environment::Production)
    }

    /// Verbose mode exposes machine-readable auth failure reasons.
    #[must_use]
    pub fn is_verbose(&self) -> bool {
        !self.is_production()
    }
}

/// Runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development; internals surfaced for debugging.
    #[default]
    Development,
    /// Public-facing deployment.
    Production,
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" | "local" | "test" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(format!("Unknown environment: {s}")),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// Admission filter operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionMode {
    /// Filter is bypassed entirely; the oracle is never called.
    Disabled,
    /// Oracle and rate buckets are consulted and logged but never block.
    DryRun,
    /// Denials are enforced.
    #[default]
    Enforce,
}

impl std::str::FromStr for AdmissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "dry-run" | "dry_run" | "dryrun" => Ok(Self::DryRun),
            "enforce" | "live" | "on" => Ok(Self::Enforce),
            _ => Err(format!("Unknown admission mode: {s}")),
        }
    }
}

impl std::fmt::Display for AdmissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::DryRun => write!(f, "dry-run"),
            Self::Enforce => write!(f, "enforce"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parsing() {
        assert_eq!("production".parse::<Environment>(), Ok(Environment::Production));
        assert_eq!("PROD".parse::<Environment>(), Ok(Environment::Production));
        assert_eq!("development".parse::<Environment>(), Ok(Environment::Development));
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_admission_mode_parsing() {
        assert_eq!("disabled".parse::<AdmissionMode>(), Ok(AdmissionMode::Disabled));
        assert_eq!("DRY_RUN".parse::<AdmissionMode>(), Ok(AdmissionMode::DryRun));
        assert_eq!("live".parse::<AdmissionMode>(), Ok(AdmissionMode::Enforce));
        assert!("sometimes".parse::<AdmissionMode>().is_err());
    }

    #[test]
    fn test_verbose_follows_environment() {
        let mut config = DeploymentConfig::default();
        assert!(config.is_verbose());
        config.environment = Environment::Production;
        assert!(config.is_production());
        assert!(!config.is_verbose());
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        for mode in [AdmissionMode::Disabled, AdmissionMode::DryRun, AdmissionMode::Enforce] {
            assert_eq!(mode.to_string().parse::<AdmissionMode>(), Ok(mode));
        }
    }
}
