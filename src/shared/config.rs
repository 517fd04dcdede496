use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => anyhow::bail!("APP_ENV must be development|production|test, got {other:?}"),
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub ca_cert: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub single_message_model: String,
    pub chat_model: String,
    pub timeout_ms: u64,
    pub max_prompt_chars: usize,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub audience: String,
    pub jwks_url: String,
    pub api_key_header: String,
}

#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub container: String,
}

#[derive(Debug, Clone)]
pub struct BusinessDefaults {
    pub name: String,
    pub gst_number: String,
    pub tax_rate_percent: u32,
}

#[derive(Debug, Clone)]
pub struct TierLimitConfig {
    pub free: u32,
    pub pro: u32,
    pub enterprise: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub env: Environment,
    pub database: DatabaseConfig,
    pub redis_url: String,
    pub llm: LlmConfig,
    pub auth: AuthConfig,
    pub blob: BlobConfig,
    pub business: BusinessDefaults,
    pub rate_limits: TierLimitConfig,
    pub error_reporting_dsn: Option<String>,
}

impl AppConfig {
    /// Loads configuration from the environment. Missing required variables
    /// fail the call; nothing starts with a half-configured process.
    pub fn load() -> Result<Self> {
        dotenv().ok();

        Ok(Self {
            port: optional("PORT", "3000").parse().context("PORT must be a number")?,
            env: Environment::parse(&optional("APP_ENV", "development"))?,
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
                max_connections: optional("DATABASE_MAX_CONNECTIONS", "10")
                    .parse()
                    .context("DATABASE_MAX_CONNECTIONS must be a number")?,
                ca_cert: env::var("DATABASE_CA_CERT").ok(),
            },
            redis_url: optional("REDIS_URL", "redis://localhost:6379"),
            llm: LlmConfig {
                api_key: required("ANTHROPIC_API_KEY")?,
                base_url: optional("ANTHROPIC_BASE_URL", "https://api.anthropic.com/v1"),
                single_message_model: optional("LLM_SINGLE_MESSAGE_MODEL", "claude-3-5-haiku-latest"),
                chat_model: optional("LLM_CHAT_MODEL", "claude-sonnet-4-5"),
                timeout_ms: optional("LLM_TIMEOUT_MS", "60000")
                    .parse()
                    .context("LLM_TIMEOUT_MS must be a number")?,
                max_prompt_chars: optional("LLM_MAX_PROMPT_CHARS", "12000")
                    .parse()
                    .context("LLM_MAX_PROMPT_CHARS must be a number")?,
            },
            auth: AuthConfig {
                audience: required("AUTH_AUDIENCE")?,
                jwks_url: required("AUTH_JWKS_URL")?,
                api_key_header: optional("API_KEY_HEADER", "x-api-key"),
            },
            blob: BlobConfig {
                endpoint: env::var("BLOB_ENDPOINT").ok(),
                access_key: required("BLOB_ACCESS_KEY")?,
                secret_key: required("BLOB_SECRET_KEY")?,
                container: optional("BLOB_CONTAINER", "invoices"),
            },
            business: BusinessDefaults {
                name: optional("BUSINESS_NAME", "My Business"),
                gst_number: optional("BUSINESS_GST_NUMBER", ""),
                tax_rate_percent: optional("BUSINESS_TAX_RATE", "18")
                    .parse()
                    .context("BUSINESS_TAX_RATE must be a number")?,
            },
            rate_limits: TierLimitConfig {
                free: optional("RATE_LIMIT_FREE", "100")
                    .parse()
                    .context("RATE_LIMIT_FREE must be a number")?,
                pro: optional("RATE_LIMIT_PRO", "1000")
                    .parse()
                    .context("RATE_LIMIT_PRO must be a number")?,
                enterprise: optional("RATE_LIMIT_ENTERPRISE", "10000")
                    .parse()
                    .context("RATE_LIMIT_ENTERPRISE must be a number")?,
                window_secs: optional("RATE_LIMIT_WINDOW_SECS", "900")
                    .parse()
                    .context("RATE_LIMIT_WINDOW_SECS must be a number")?,
            },
            error_reporting_dsn: env::var("ERROR_REPORTING_DSN").ok(),
        })
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

fn optional(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_known_values() {
        assert_eq!(Environment::parse("development").unwrap(), Environment::Development);
        assert_eq!(Environment::parse("production").unwrap(), Environment::Production);
        assert_eq!(Environment::parse("test").unwrap(), Environment::Test);
        assert!(Environment::parse("staging").is_err());
    }

    #[test]
    fn production_flag() {
        assert!(Environment::Production.is_production());
        assert!(!Environment::Development.is_production());
    }
}
