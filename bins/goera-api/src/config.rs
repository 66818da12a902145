// Dispatcher configuration, read once from the environment at boot
use std::path::PathBuf;
use std::time::Duration;

use goera_common::config::{env_or, env_parse, ConfigError};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_WORKERS: usize = 2;
const DEFAULT_BASE_PORT: u16 = 8081;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub listen_addr: String,
    /// Base URL of the web backend that stores verdicts
    pub result_sink_url: String,
    /// Shared secret sent as `X-API-Key` on every report
    pub api_key: Option<String>,
    pub worker_bin: PathBuf,
    pub worker_host: String,
    pub state_dir: PathBuf,
    pub initial_workers: usize,
    pub base_port: u16,
    pub report_timeout: Duration,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("INTERNAL_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());

        Ok(Self {
            listen_addr: env_or("GOERA_LISTEN_ADDR", DEFAULT_LISTEN_ADDR),
            result_sink_url: env_or("GOERA_RESULT_SINK_URL", "http://127.0.0.1:5000"),
            api_key,
            worker_bin: PathBuf::from(env_or("GOERA_WORKER_BIN", "goera-worker")),
            worker_host: env_or("GOERA_WORKER_HOST", "127.0.0.1"),
            state_dir: PathBuf::from(env_or("GOERA_STATE_DIR", ".goera")),
            initial_workers: env_parse("GOERA_WORKERS", DEFAULT_WORKERS)?,
            base_port: env_parse("GOERA_BASE_PORT", DEFAULT_BASE_PORT)?,
            report_timeout: Duration::from_millis(env_parse("GOERA_REPORT_TIMEOUT_MS", 10_000)?),
        })
    }

    /// Port of the dispatcher's own listener; workers must never be given it
    pub fn listen_port(&self) -> Option<u16> {
        self.listen_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_default_listen_port_outside_worker_range() {
        let listen = DEFAULT_LISTEN_ADDR.parse::<SocketAddr>().unwrap().port();
        let workers = DEFAULT_BASE_PORT..DEFAULT_BASE_PORT + DEFAULT_WORKERS as u16;
        assert!(!workers.contains(&listen));
    }

    #[test]
    fn test_listen_port() {
        let mut config = ApiConfig {
            listen_addr: "0.0.0.0:8082".to_string(),
            result_sink_url: "http://127.0.0.1:5000".to_string(),
            api_key: None,
            worker_bin: PathBuf::from("goera-worker"),
            worker_host: "127.0.0.1".to_string(),
            state_dir: PathBuf::from(".goera"),
            initial_workers: DEFAULT_WORKERS,
            base_port: DEFAULT_BASE_PORT,
            report_timeout: Duration::from_secs(10),
        };
        assert_eq!(config.listen_port(), Some(8082));

        config.listen_addr = "[::]:9000".to_string();
        assert_eq!(config.listen_port(), Some(9000));

        config.listen_addr = "localhost".to_string();
        assert_eq!(config.listen_port(), None);
    }
}
