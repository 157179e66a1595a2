use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub db_max_connections: u32,
    /// Per-connection bound on queued trip-status events.
    pub status_queue_capacity: usize,
    pub settlement_retry_interval: Duration,
    /// How long a settlement may stay `pending` before the retry sweep takes it.
    pub settlement_grace: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://haulage.db".to_string());
        let listen_addr: SocketAddr = parse_var("APP_LISTEN_ADDR", "127.0.0.1:3000")?;
        let db_max_connections = parse_var("DB_MAX_CONNECTIONS", "10")?;
        let status_queue_capacity: usize = parse_var("STATUS_QUEUE_CAPACITY", "1024")?;
        if status_queue_capacity == 0 {
            return Err(AppError::Config(
                "STATUS_QUEUE_CAPACITY must be at least 1".into(),
            ));
        }
        let settlement_retry_interval =
            Duration::from_secs(parse_var("SETTLEMENT_RETRY_SECS", "30")?);
        let settlement_grace = Duration::from_secs(parse_var("SETTLEMENT_GRACE_SECS", "60")?);

        Ok(Self {
            database_url,
            listen_addr,
            db_max_connections,
            status_queue_capacity,
            settlement_retry_interval,
            settlement_grace,
        })
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|err| AppError::Config(format!("invalid {name}: {err}")))
}
