//! Environment Configuration
//!
//! Loaded with the `config` crate layered over `dotenvy`-sourced
//! process environment variables: the identity/database/arbiter
//! settings a deployment must supply, plus two ambient keys every
//! runnable binary needs — `bind_addr` (host:port for the control
//! plane) and `rust_log` (tracing filter directive).

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    /// Absent: the in-memory arbiter is used, which is fine for a
    /// single-process deployment or local development.
    pub arbiter_url: Option<String>,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    pub identity_secret: String,
    pub video_app_id: Option<String>,
    pub video_app_cert: Option<String>,
    #[serde(default = "default_rust_log")]
    pub rust_log: String,
}

fn default_rust_log() -> String {
    "info".to_owned()
}

impl Config {
    /// Loads `.env` (if present) then layers environment variables
    /// prefixed `AUCTIONHOUSE_` over the defaults below.
    pub fn load() -> Result<Self, config::ConfigError> {
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .set_default("bind_addr", "0.0.0.0:8080")?
            .set_default("cors_origins", Vec::<String>::new())?
            .set_default("rust_log", default_rust_log())?
            .add_source(
                config::Environment::with_prefix("AUCTIONHOUSE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cors_origins")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_from_process_environment() {
        std::env::set_var("AUCTIONHOUSE_DATABASE_URL", "postgres://localhost/test");
        std::env::set_var("AUCTIONHOUSE_IDENTITY_SECRET", "shh");
        std::env::set_var("AUCTIONHOUSE_CORS_ORIGINS", "http://a.test,http://b.test");

        let config = Config::load().unwrap();
        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.identity_secret, "shh");
        assert_eq!(
            config.cors_origins,
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
        assert_eq!(config.bind_addr, "0.0.0.0:8080");

        std::env::remove_var("AUCTIONHOUSE_DATABASE_URL");
        std::env::remove_var("AUCTIONHOUSE_IDENTITY_SECRET");
        std::env::remove_var("AUCTIONHOUSE_CORS_ORIGINS");
    }
}
