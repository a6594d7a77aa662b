//! Process configuration resolved from the environment
//!
//! A typed config struct built from `std::env::var` with documented
//! fallbacks, loaded once at process start.

use crate::error::{Error, Result};

/// Transport wire encoding for the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

impl std::str::FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            other => Err(Error::Configuration(format!(
                "unknown transport kind: {other}"
            ))),
        }
    }
}

/// Broker credentials, when the deployment requires authentication.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Process-wide configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace prefix for every topic path (`namespace/host/pid/sid`).
    pub namespace: String,
    /// Broker host, tried in order until one connects.
    pub broker_hosts: Vec<String>,
    pub broker_port: u16,
    pub transport: TransportKind,
    pub credentials: Option<Credentials>,
    pub log_level: String,
}

const DEFAULT_BROKER_HOSTS: &[&str] = &["localhost", "127.0.0.1"];
const DEFAULT_BROKER_PORT: u16 = 1883;

impl Config {
    /// Build a `Config` from the process environment.
    ///
    /// `AIKO_NAMESPACE` is required; everything else falls back to a
    /// documented default. Missing `AIKO_NAMESPACE` is a configuration
    /// error (fatal at construction, per the error taxonomy).
    pub fn from_env() -> Result<Self> {
        let namespace = std::env::var("AIKO_NAMESPACE").map_err(|_| {
            Error::Configuration("AIKO_NAMESPACE environment variable is not set".into())
        })?;

        let broker_hosts = match std::env::var("AIKO_BROKER_HOST") {
            Ok(value) => value.split(',').map(|s| s.trim().to_string()).collect(),
            Err(_) => DEFAULT_BROKER_HOSTS.iter().map(|s| s.to_string()).collect(),
        };

        let broker_port = std::env::var("AIKO_BROKER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_BROKER_PORT);

        let transport = std::env::var("AIKO_TRANSPORT")
            .ok()
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(TransportKind::Tcp);

        let credentials = match (
            std::env::var("AIKO_BROKER_USERNAME"),
            std::env::var("AIKO_BROKER_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) => Some(Credentials { username, password }),
            _ => None,
        };

        let log_level = std::env::var("AIKO_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Config {
            namespace,
            broker_hosts,
            broker_port,
            transport,
            credentials,
            log_level,
        })
    }
}

/// Install a `tracing` subscriber honoring `RUST_LOG`, falling back to the
/// resolved config's log level.
pub fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            "AIKO_NAMESPACE",
            "AIKO_BROKER_HOST",
            "AIKO_BROKER_PORT",
            "AIKO_TRANSPORT",
            "AIKO_BROKER_USERNAME",
            "AIKO_BROKER_PASSWORD",
            "AIKO_LOG_LEVEL",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn missing_namespace_is_configuration_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let result = Config::from_env();
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn defaults_are_applied() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("AIKO_NAMESPACE", "AIKO");
        let config = Config::from_env().unwrap();
        assert_eq!(config.namespace, "AIKO");
        assert_eq!(config.broker_port, DEFAULT_BROKER_PORT);
        assert_eq!(config.transport, TransportKind::Tcp);
        assert!(config.credentials.is_none());
        clear_env();
    }

    #[test]
    fn transport_parses_case_insensitively() {
        assert_eq!("TCP".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!(
            "WebSocket".parse::<TransportKind>().unwrap(),
            TransportKind::WebSocket
        );
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
