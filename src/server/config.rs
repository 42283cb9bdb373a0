use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: String,
    /// How often the registry scans for dead connections.
    pub heartbeat_check_interval: Duration,
    /// A connection whose last heartbeat is older than this is torn down.
    pub heartbeat_timeout: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let heartbeat_check_interval = env_secs("HEARTBEAT_CHECK_INTERVAL_SECS", 10)?;
        let heartbeat_timeout = env_secs("HEARTBEAT_TIMEOUT_SECS", 65)?;

        Ok(ServerConfig {
            database_url,
            bind_addr,
            heartbeat_check_interval,
            heartbeat_timeout,
        })
    }
}

fn env_secs(key: &str, default: u64) -> Result<Duration, String> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| format!("{key} must be an integer number of seconds")),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_secs_falls_back_to_default() {
        assert_eq!(
            env_secs("INFLOW_TEST_UNSET_KEY", 65).unwrap(),
            Duration::from_secs(65)
        );
    }
}
