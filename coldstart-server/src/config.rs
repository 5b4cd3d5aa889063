use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

const DEV_AUTH_SECRET: &str = "coldstart-dev-secret";

pub struct Config {
    pub http_addr: String,
    pub ws_addr: String,
    pub db_path: String,
    pub auth_secret: String,
    pub require_join_token: bool,
    pub join_timeout: Duration,
}

impl Config {
    /// Read configuration from the environment (and `.env`, if present).
    pub fn load() -> Self {
        if dotenvy::dotenv().is_ok() {
            info!("Loaded environment from .env");
        }

        let auth_secret = var("COLDSTART_AUTH_SECRET").unwrap_or_else(|_| {
            warn!("COLDSTART_AUTH_SECRET not set, using development secret");
            DEV_AUTH_SECRET.to_string()
        });

        Self {
            http_addr: try_load("COLDSTART_HTTP_ADDR", "0.0.0.0:8080"),
            ws_addr: try_load("COLDSTART_WS_ADDR", "0.0.0.0:9001"),
            db_path: try_load("COLDSTART_DB_PATH", "coldstart.db"),
            auth_secret,
            require_join_token: try_load("COLDSTART_REQUIRE_JOIN_TOKEN", "false"),
            join_timeout: Duration::from_secs(try_load("COLDSTART_JOIN_TIMEOUT_SECS", "10")),
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| ())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
        })
        .expect("Environment misconfigured!")
}
