use std::env;
use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_expiration_secs: u64,
    pub guest_token_expiration_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_requests: u32,
    pub server_host: String,
    pub server_port: u16,
    pub api_base_uri: String,
    pub reset_step_timeout_secs: u64,
    pub seed_admin_username: String,
    pub seed_admin_password: String,
}

/// Store handle selected by `DATABASE_URL=memory://`.
pub const MEMORY_DATABASE_URL: &str = "memory://";

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenv::dotenv().ok();

        let jwt_expiration = env::var("JWT_EXPIRATION")
            .unwrap_or_else(|_| "24h".into())
            .trim_end_matches('h')
            .parse::<u64>()
            .unwrap_or(24);
        let guest_token_expiration = env::var("GUEST_TOKEN_EXPIRATION")
            .unwrap_or_else(|_| "4h".into())
            .trim_end_matches('h')
            .parse::<u64>()
            .unwrap_or(4);
        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            jwt_secret: env::var("JWT_SECRET")?,
            jwt_expiration_secs: jwt_expiration * 3600,
            guest_token_expiration_secs: guest_token_expiration * 3600,
            rate_limit_window_secs: parse_or("RATE_LIMIT_WINDOW", 60),
            rate_limit_requests: parse_or("RATE_LIMIT_REQUESTS", 100),
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "::".into()),
            server_port: parse_or("SERVER_PORT", 3000),
            api_base_uri: env::var("API_BASE_URI").unwrap_or_else(|_| "/api".into()),
            reset_step_timeout_secs: parse_or("RESET_STEP_TIMEOUT", 30),
            seed_admin_username: env::var("SEED_ADMIN_USERNAME").unwrap_or_else(|_| "admin".into()),
            seed_admin_password: env::var("SEED_ADMIN_PASSWORD")?,
        })
    }

    pub fn jwt_expiration(&self) -> Duration {
        Duration::from_secs(self.jwt_expiration_secs)
    }

    pub fn guest_token_expiration(&self) -> Duration {
        Duration::from_secs(self.guest_token_expiration_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn reset_step_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_step_timeout_secs)
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url == MEMORY_DATABASE_URL
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Config {
            database_url: MEMORY_DATABASE_URL.into(),
            redis_url: None,
            jwt_secret: "test-secret".into(),
            jwt_expiration_secs: 3600,
            guest_token_expiration_secs: 600,
            rate_limit_window_secs: 60,
            rate_limit_requests: 100,
            server_host: "127.0.0.1".into(),
            server_port: 0,
            api_base_uri: "/api".into(),
            reset_step_timeout_secs: 30,
            seed_admin_username: "admin".into(),
            seed_admin_password: "admin-password".into(),
        }
    }
}
