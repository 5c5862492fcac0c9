use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory name used for user- and project-level configuration
pub const CONFIG_DIR: &str = ".vaultgate";

pub const MAX_SESSION_TTL_SECS: u64 = 86_400;
pub const MAX_TOKEN_TTL_MINUTES: u64 = 1440;
pub const MAX_CLOCK_SKEW_SECS: u64 = 300;

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// Evict a session when it is presented from a different identity.
    /// When false the mismatch is logged and tolerated.
    #[serde(default = "default_true")]
    pub strict_identity_binding: bool,
    /// Explicit session creation drops any other live session of the same identity
    #[serde(default = "default_true")]
    pub single_session_per_identity: bool,
    /// Recreate a missing or expired session named by a fully verified token
    #[serde(default = "default_true")]
    pub reestablish_from_token: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_session_ttl_secs() -> u64 {
    3600 // 1 hour
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            strict_identity_binding: true,
            single_session_per_identity: true,
            reestablish_from_token: true,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl SessionConfig {
    /// Values above the accepted maximum are clamped; `Config::validate` rejects them
    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs.min(MAX_SESSION_TTL_SECS) as i64)
    }
}

/// Capability token settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TokenConfig {
    #[serde(default = "default_token_ttl_minutes")]
    pub ttl_minutes: u64,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// How far in the future a token's issue time may lie before it is rejected
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u64,
}

fn default_token_ttl_minutes() -> u64 {
    15
}

fn default_issuer() -> String {
    "vaultgate".to_string()
}

fn default_max_clock_skew_secs() -> u64 {
    30
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_token_ttl_minutes(),
            issuer: default_issuer(),
            max_clock_skew_secs: default_max_clock_skew_secs(),
        }
    }
}

impl TokenConfig {
    pub fn ttl(&self) -> Duration {
        Duration::minutes(self.ttl_minutes.min(MAX_TOKEN_TTL_MINUTES) as i64)
    }

    pub fn max_clock_skew(&self) -> Duration {
        Duration::seconds(self.max_clock_skew_secs.min(MAX_CLOCK_SKEW_SECS) as i64)
    }
}

/// Per-identity request quota
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: usize,
}

fn default_max_requests_per_minute() -> usize {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_max_requests_per_minute(),
        }
    }
}

/// Decision audit trail
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

/// One config layer as written on disk. Every field is optional so a layer
/// only overrides what it actually sets.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigLayer {
    #[serde(default)]
    session: SessionLayer,
    #[serde(default)]
    token: TokenLayer,
    #[serde(default)]
    rate_limit: RateLimitLayer,
    #[serde(default)]
    audit: AuditConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SessionLayer {
    ttl_secs: Option<u64>,
    strict_identity_binding: Option<bool>,
    single_session_per_identity: Option<bool>,
    reestablish_from_token: Option<bool>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TokenLayer {
    ttl_minutes: Option<u64>,
    issuer: Option<String>,
    max_clock_skew_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RateLimitLayer {
    max_requests_per_minute: Option<usize>,
}

impl Config {
    /// Load configuration from default paths
    /// Priority: local (.vaultgate/config.local.toml) > project (.vaultgate/config.toml)
    /// > user (~/.vaultgate/config.toml) > built-in defaults
    pub fn load() -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(CONFIG_DIR).join("config.toml"));
        }
        paths.push(Path::new(CONFIG_DIR).join("config.toml"));
        paths.push(Path::new(CONFIG_DIR).join("config.local.toml"));

        let mut config = Self::default();
        for path in paths.iter().filter(|p| p.exists()) {
            config.merge_file(path)?;
        }
        Ok(config)
    }

    /// Load configuration from a specific path, on top of the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.merge_file(path)?;
        Ok(config)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let layer: ConfigLayer = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        self.merge(layer);
        Ok(())
    }

    /// Merge a layer into this config (the layer takes priority where it sets a value)
    fn merge(&mut self, other: ConfigLayer) {
        let s = other.session;
        if let Some(v) = s.ttl_secs {
            self.session.ttl_secs = v;
        }
        if let Some(v) = s.strict_identity_binding {
            self.session.strict_identity_binding = v;
        }
        if let Some(v) = s.single_session_per_identity {
            self.session.single_session_per_identity = v;
        }
        if let Some(v) = s.reestablish_from_token {
            self.session.reestablish_from_token = v;
        }
        if let Some(v) = s.sweep_interval_secs {
            self.session.sweep_interval_secs = v;
        }

        let t = other.token;
        if let Some(v) = t.ttl_minutes {
            self.token.ttl_minutes = v;
        }
        if let Some(v) = t.issuer {
            self.token.issuer = v;
        }
        if let Some(v) = t.max_clock_skew_secs {
            self.token.max_clock_skew_secs = v;
        }

        if let Some(v) = other.rate_limit.max_requests_per_minute {
            self.rate_limit.max_requests_per_minute = v;
        }

        if other.audit.path.is_some() {
            self.audit.path = other.audit.path;
        }
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !(1..=MAX_SESSION_TTL_SECS).contains(&self.session.ttl_secs) {
            errors.push(ValidationError {
                field: "session.ttl_secs".to_string(),
                message: format!(
                    "Must be between 1 and {}, got {}",
                    MAX_SESSION_TTL_SECS, self.session.ttl_secs
                ),
            });
        }

        if self.session.sweep_interval_secs == 0 {
            errors.push(ValidationError {
                field: "session.sweep_interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if !(1..=MAX_TOKEN_TTL_MINUTES).contains(&self.token.ttl_minutes) {
            errors.push(ValidationError {
                field: "token.ttl_minutes".to_string(),
                message: format!(
                    "Must be between 1 and {}, got {}",
                    MAX_TOKEN_TTL_MINUTES, self.token.ttl_minutes
                ),
            });
        }

        if self.token.max_clock_skew_secs > MAX_CLOCK_SKEW_SECS {
            errors.push(ValidationError {
                field: "token.max_clock_skew_secs".to_string(),
                message: format!(
                    "Must be at most {}, got {}",
                    MAX_CLOCK_SKEW_SECS, self.token.max_clock_skew_secs
                ),
            });
        }

        if self.token.issuer.trim().is_empty() {
            errors.push(ValidationError {
                field: "token.issuer".to_string(),
                message: "Issuer must not be empty".to_string(),
            });
        }

        if self.rate_limit.max_requests_per_minute == 0 {
            errors.push(ValidationError {
                field: "rate_limit.max_requests_per_minute".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.session.ttl_secs, 3600);
        assert!(config.session.strict_identity_binding);
        assert_eq!(config.token.ttl_minutes, 15);
        assert_eq!(config.token.issuer, "vaultgate");
        assert_eq!(config.rate_limit.max_requests_per_minute, 60);
        assert!(config.audit.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[token]\nttl_minutes = 1440\n\n[session]\nstrict_identity_binding = false\n"
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.token.ttl_minutes, 1440);
        assert!(!config.session.strict_identity_binding);
        // Untouched fields keep their defaults
        assert_eq!(config.session.ttl_secs, 3600);
        assert_eq!(config.token.issuer, "vaultgate");
    }

    #[test]
    fn test_merge_layers_in_order() {
        let mut config = Config::default();
        config.merge(toml::from_str("[rate_limit]\nmax_requests_per_minute = 120\n").unwrap());
        config.merge(toml::from_str("[session]\nttl_secs = 600\n").unwrap());

        // The second layer did not mention rate_limit, so the first layer's value survives
        assert_eq!(config.rate_limit.max_requests_per_minute, 120);
        assert_eq!(config.session.ttl_secs, 600);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[token\nttl_minutes = ").unwrap();
        assert!(Config::load_from(file.path()).is_err());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.session.ttl_secs = 0;
        config.token.ttl_minutes = 2000;
        config.token.issuer = "  ".to_string();
        config.rate_limit.max_requests_per_minute = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.field == "session.ttl_secs"));
        assert!(errors
            .iter()
            .any(|e| e.message.contains("between 1 and 1440")));
    }

    #[test]
    fn test_validate_bounds_durations() {
        let mut config = Config::default();
        config.session.ttl_secs = MAX_SESSION_TTL_SECS + 1;
        config.token.max_clock_skew_secs = 10_000_000_000_000;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.field == "session.ttl_secs"));
        assert!(errors
            .iter()
            .any(|e| e.field == "token.max_clock_skew_secs"));

        config.session.ttl_secs = MAX_SESSION_TTL_SECS;
        config.token.max_clock_skew_secs = MAX_CLOCK_SKEW_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_helpers_clamp_out_of_range_values() {
        let token = TokenConfig {
            ttl_minutes: u64::MAX,
            max_clock_skew_secs: u64::MAX,
            ..TokenConfig::default()
        };
        assert_eq!(token.ttl(), Duration::minutes(1440));
        assert_eq!(token.max_clock_skew(), Duration::seconds(300));

        let session = SessionConfig {
            ttl_secs: u64::MAX,
            ..SessionConfig::default()
        };
        assert_eq!(session.ttl(), Duration::seconds(86_400));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError {
            field: "token.issuer".to_string(),
            message: "Issuer must not be empty".to_string(),
        };
        assert_eq!(err.to_string(), "[token.issuer]: Issuer must not be empty");
    }
}
