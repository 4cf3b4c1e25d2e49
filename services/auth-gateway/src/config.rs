use axum::http::HeaderValue;
use config::{ConfigError, Environment, File};
use security_core::SecurityConfig;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Interval between rate limiter sweeps
    pub limiter_cleanup_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    /// Postgres URL; without one the gateway keeps accounts in memory
    pub url: Option<String>,
    pub max_connections: u32,
    /// Write audit events to the `audit_logs` table when connected
    #[serde(default = "default_audit_log")]
    pub audit_log: bool,
}

fn default_audit_log() -> bool {
    true
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "[REDACTED]"))
            .field("max_connections", &self.max_connections)
            .field("audit_log", &self.audit_log)
            .finish()
    }
}

impl CorsConfig {
    pub fn header_values(&self) -> Result<Vec<HeaderValue>, String> {
        self.allowed_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .map_err(|_| format!("Invalid CORS origin: {}", origin))
            })
            .collect()
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("server.limiter_cleanup_secs", 60)?
            .set_default("cors.allowed_origins", vec!["http://localhost:5173"])?
            .set_default("database.max_connections", 10)?
            .set_default("database.audit_log", true)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("AUTH_GATEWAY")
                .separator("__")
                .try_parsing(true),
        );

        // Special handling for common env vars
        if let Ok(secret) = env::var("JWT_SECRET") {
            builder = builder.set_override("security.token.secret", secret)?;
        }

        if let Ok(key) = env::var("AES_KEY") {
            builder = builder.set_override("security.vault.key", key)?;
        }

        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }

        if let Ok(port) = env::var("AUTH_GATEWAY_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        if let Ok(origins) = env::var("CORS_ALLOWED_ORIGINS") {
            let origins: Vec<String> = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
            builder = builder.set_override("cors.allowed_origins", origins)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.server.limiter_cleanup_secs == 0 {
            return Err("Limiter cleanup interval cannot be 0".to_string());
        }

        if self.cors.allowed_origins.is_empty() {
            return Err("At least one CORS origin is required".to_string());
        }
        self.cors.header_values()?;

        if matches!(&self.database.url, Some(url) if url.is_empty()) {
            return Err("Database URL cannot be empty".to_string());
        }

        self.security.validate().map_err(|e| e.to_string())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                limiter_cleanup_secs: 60,
            },
            cors: CorsConfig {
                allowed_origins: vec!["http://localhost:5173".to_string()],
            },
            database: DatabaseConfig {
                url: None,
                max_connections: 10,
                audit_log: true,
            },
            security: SecurityConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate().is_ok());
        assert_eq!(config().bind_addr(), "127.0.0.1:3000");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut c = config();
        c.server.port = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.cors.allowed_origins = vec!["bad\norigin".to_string()];
        assert!(c.validate().is_err());

        let mut c = config();
        c.security.rate_limiter.max_attempts = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_database_url_redacted() {
        let mut c = config();
        c.database.url = Some("postgres://titan:hunter2@db/titan".to_string());
        assert!(!format!("{:?}", c).contains("hunter2"));
    }
}
