use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub tokens: TokenConfig,
    pub invitations: InvitationConfig,
    pub cert_cache: CertCacheConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenConfig {
    /// Random bytes per token secret.
    pub secret_bytes: usize,
    /// Applied when `issue` is called without a TTL. `None` means no expiry.
    pub default_ttl_minutes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvitationConfig {
    pub default_ttl_hours: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CertCacheConfig {
    pub max_entries: usize,
    pub renewal_margin_seconds: i64,
    pub fetch_timeout_seconds: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret_bytes: 32,
            default_ttl_minutes: None,
        }
    }
}

impl TokenConfig {
    pub fn default_ttl(&self) -> Option<chrono::Duration> {
        self.default_ttl_minutes.map(chrono::Duration::minutes)
    }
}

impl Default for InvitationConfig {
    fn default() -> Self {
        Self {
            default_ttl_hours: 168, // 7 days
        }
    }
}

impl InvitationConfig {
    pub fn default_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.default_ttl_hours)
    }
}

impl Default for CertCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            renewal_margin_seconds: 30 * 24 * 60 * 60,
            fetch_timeout_seconds: 30,
        }
    }
}

impl CertCacheConfig {
    pub fn renewal_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.renewal_margin_seconds)
    }

    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.fetch_timeout_seconds)
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "identity-service".to_string(),
            tokens: TokenConfig::default(),
            invitations: InvitationConfig::default(),
            cert_cache: CertCacheConfig::default(),
        }
    }
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let defaults = IdentityConfig::default();

        let default_ttl_minutes = get_env("IDENTITY_TOKEN_DEFAULT_TTL_MINUTES", Some(""), false)?;

        let config = IdentityConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            tokens: TokenConfig {
                secret_bytes: parse_env(
                    "IDENTITY_TOKEN_SECRET_BYTES",
                    defaults.tokens.secret_bytes,
                    is_prod,
                )?,
                default_ttl_minutes: if default_ttl_minutes.is_empty() {
                    None
                } else {
                    Some(parse_value(
                        "IDENTITY_TOKEN_DEFAULT_TTL_MINUTES",
                        &default_ttl_minutes,
                    )?)
                },
            },
            invitations: InvitationConfig {
                default_ttl_hours: parse_env(
                    "IDENTITY_INVITATION_TTL_HOURS",
                    defaults.invitations.default_ttl_hours,
                    is_prod,
                )?,
            },
            cert_cache: CertCacheConfig {
                max_entries: parse_env(
                    "IDENTITY_CERT_CACHE_MAX_ENTRIES",
                    defaults.cert_cache.max_entries,
                    is_prod,
                )?,
                renewal_margin_seconds: parse_env(
                    "IDENTITY_CERT_RENEWAL_MARGIN_SECONDS",
                    defaults.cert_cache.renewal_margin_seconds,
                    is_prod,
                )?,
                fetch_timeout_seconds: parse_env(
                    "IDENTITY_CERT_FETCH_TIMEOUT_SECONDS",
                    defaults.cert_cache.fetch_timeout_seconds,
                    is_prod,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the stores cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.tokens.secret_bytes < 16 {
            return Err(config_error("token secrets need at least 16 random bytes"));
        }
        if self.tokens.default_ttl_minutes.is_some_and(|m| m <= 0) {
            return Err(config_error("default token TTL must be positive"));
        }
        if self.invitations.default_ttl_hours <= 0 {
            return Err(config_error("invitation TTL must be positive"));
        }
        if self.cert_cache.max_entries == 0 {
            return Err(config_error("certificate cache needs room for one entry"));
        }
        if self.cert_cache.renewal_margin_seconds < 0 {
            return Err(config_error("renewal margin cannot be negative"));
        }
        if self.cert_cache.fetch_timeout_seconds == 0 {
            return Err(config_error("certificate fetch timeout must be positive"));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> AppError {
    AppError::ConfigError(anyhow::anyhow!(message.to_string()))
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr + ToString,
    T::Err: std::fmt::Display,
{
    let raw = get_env(key, Some(&default.to_string()), is_prod)?;
    parse_value(key, &raw)
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        AppError::ConfigError(anyhow::anyhow!(format!("Invalid value for {}: {}", key, e)))
    })
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
