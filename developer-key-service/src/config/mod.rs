use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::fmt::Display;
use std::str::FromStr;

use crate::models::{AccountId, ShardId};
use crate::services::tool_lifecycle::ToolManagementConfig;

#[derive(Debug, Clone)]
pub struct DeveloperKeyConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    /// Falls back to the in-process cache when unset outside production.
    pub redis: Option<RedisConfig>,
    pub cache: CacheConfig,
    pub jwt: JwtConfig,
    pub site_admin: SiteAdminConfig,
    pub test_cluster: TestClusterConfig,
    pub tokens: TokenConfig,
    pub tool_management: ToolManagementConfig,
    /// Regions and their shards, e.g. `us-east=1,2;eu-west=3`.
    pub topology: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// HMAC secret for tokens presented back to this service.
    pub signing_secret: String,
    /// PEM private key for externally audienced tokens.
    pub private_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteAdminConfig {
    pub account_id: AccountId,
    pub shard_id: ShardId,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestClusterConfig {
    /// Enforce test-cluster-only keys regardless of the settings store.
    pub checks_enabled: bool,
    /// This deployment is a test cluster.
    pub is_test_cluster: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub public_client_token_ttl_minutes: f64,
}

impl DeveloperKeyConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let redis_url = get_env("REDIS_URL", Some(""), is_prod)?;
        let private_key_path = get_env("JWT_PRIVATE_KEY_PATH", Some(""), is_prod)?;

        let config = DeveloperKeyConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("developer-key-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            redis: (!redis_url.trim().is_empty()).then(|| RedisConfig { url: redis_url }),
            cache: CacheConfig {
                ttl_seconds: parse_env("DEVELOPER_KEY_CACHE_TTL_SECONDS", Some("300"), is_prod)?,
            },
            jwt: JwtConfig {
                signing_secret: get_env("JWT_SIGNING_SECRET", None, is_prod)?,
                private_key_path: (!private_key_path.trim().is_empty()).then_some(private_key_path),
            },
            site_admin: SiteAdminConfig {
                account_id: parse_env("SITE_ADMIN_ACCOUNT_ID", Some("1"), is_prod)?,
                shard_id: parse_env("SITE_ADMIN_SHARD_ID", Some("1"), is_prod)?,
            },
            test_cluster: TestClusterConfig {
                checks_enabled: parse_env("DEV_KEY_TEST_CLUSTER_CHECKS_ENABLED", Some("false"), is_prod)?,
                is_test_cluster: parse_env("TEST_CLUSTER", Some("false"), is_prod)?,
            },
            tokens: TokenConfig {
                public_client_token_ttl_minutes: parse_env(
                    "PUBLIC_CLIENT_TOKEN_TTL_MINUTES",
                    Some("120"),
                    is_prod,
                )?,
            },
            tool_management: ToolManagementConfig {
                batch_size: parse_env("TOOL_MANAGEMENT_BATCH_SIZE", Some("1000"), is_prod)?,
                max_attempts: parse_env("TOOL_MANAGEMENT_MAX_ATTEMPTS", Some("4"), is_prod)?,
            },
            topology: get_env("SHARD_TOPOLOGY", Some("default=1"), is_prod)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.signing_secret.len() < 32 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_SIGNING_SECRET must be at least 32 bytes"
            )));
        }

        if self.tokens.public_client_token_ttl_minutes <= 0.0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PUBLIC_CLIENT_TOKEN_TTL_MINUTES must be positive"
            )));
        }

        if self.tool_management.batch_size == 0 || self.tool_management.max_attempts == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOOL_MANAGEMENT_BATCH_SIZE and TOOL_MANAGEMENT_MAX_ATTEMPTS must be positive"
            )));
        }

        if self.environment == Environment::Prod && self.jwt.private_key_path.is_none() {
            tracing::error!(
                "No JWT_PRIVATE_KEY_PATH in production - externally audienced keys cannot get tokens"
            );
        }

        Ok(())
    }
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

fn parse_env<T>(key: &str, default: Option<&str>, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: Display,
{
    get_env(key, default, is_prod)?
        .trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
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

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeveloperKeyConfig {
        DeveloperKeyConfig {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "developer-key-service".to_string(),
            service_version: "test".to_string(),
            log_level: "debug".to_string(),
            redis: None,
            cache: CacheConfig { ttl_seconds: 300 },
            jwt: JwtConfig {
                signing_secret: "0123456789abcdef0123456789abcdef".to_string(),
                private_key_path: None,
            },
            site_admin: SiteAdminConfig {
                account_id: 1,
                shard_id: 1,
            },
            test_cluster: TestClusterConfig::default(),
            tokens: TokenConfig {
                public_client_token_ttl_minutes: 120.0,
            },
            tool_management: ToolManagementConfig::default(),
            topology: "default=1".to_string(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_short_signing_secret_is_rejected() {
        let mut config = config();
        config.jwt.signing_secret = "short".to_string();
        assert!(matches!(config.validate(), Err(AppError::ConfigError(_))));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let mut config = config();
        config.tool_management.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_get_env_defaults_outside_production() {
        let key = "DEVELOPER_KEY_SERVICE_TEST_UNSET_VARIABLE";
        assert_eq!(get_env(key, Some("fallback"), false).unwrap(), "fallback");
        assert!(get_env(key, Some("fallback"), true).is_err());
        assert!(get_env(key, None, false).is_err());
        assert_eq!(parse_env::<u32>(key, Some(" 4 "), false).unwrap(), 4);
        assert!(parse_env::<u32>(key, Some("four"), false).is_err());
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("staging".parse::<Environment>().is_err());
    }
}
