//! Server configuration
//!
//! Values come from defaults, then an optional JSON file (`--config`), then
//! command-line flags, each layer overriding the previous one.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use peer_link::wire::MAX_LINE_LEN;
use serde::Deserialize;

/// Runtime settings for the relay server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address
    pub bind: SocketAddr,
    /// Longest accepted inbound line; longer lines close the connection
    pub max_line_bytes: usize,
    /// Push `user-list` to everyone after each login and departure
    pub broadcast_presence: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], 9000)),
            max_line_bytes: MAX_LINE_LEN,
            broadcast_presence: true,
        }
    }
}

impl ServerConfig {
    /// Parse a JSON configuration document
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Build from command-line arguments
    ///
    /// --config <file.json>   JSON file with any of the fields below
    /// --bind <addr:port>     Listen address (default 0.0.0.0:9000)
    /// --max-line-bytes <n>   Longest accepted line
    /// --no-presence          Do not broadcast user lists
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = match parse_arg(args, "--config") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => ServerConfig::default(),
        };

        if let Some(bind) = parse_arg(args, "--bind") {
            config.bind = bind
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("bind address '{}'", bind)))?;
        }
        if let Some(max) = parse_arg(args, "--max-line-bytes") {
            config.max_line_bytes = max
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("max line bytes '{}'", max)))?;
        }
        if args.iter().any(|a| a == "--no-presence") {
            config.broadcast_presence = false;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_line_bytes < 64 {
            return Err(ConfigError::Invalid(format!(
                "max_line_bytes {} is too small",
                self.max_line_bytes
            )));
        }
        Ok(())
    }
}

/// Value following `flag`, if present
pub fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "cannot parse config: {}", e),
            ConfigError::Invalid(e) => write!(f, "invalid {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("relay-server")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config.bind, SocketAddr::from(([0, 0, 0, 0], 9000)));
        assert_eq!(config.max_line_bytes, MAX_LINE_LEN);
        assert!(config.broadcast_presence);
    }

    #[test]
    fn test_flags_override() {
        let config = ServerConfig::from_args(&args(&[
            "--bind",
            "127.0.0.1:7000",
            "--max-line-bytes",
            "1024",
            "--no-presence",
        ]))
        .unwrap();
        assert_eq!(config.bind, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.max_line_bytes, 1024);
        assert!(!config.broadcast_presence);
    }

    #[test]
    fn test_json_partial() {
        let config = ServerConfig::from_json(r#"{"bind": "127.0.0.1:9100"}"#).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9100".parse().unwrap());
        assert!(config.broadcast_presence);

        assert!(matches!(
            ServerConfig::from_json(r#"{"bogus": 1}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_file_then_flags() {
        let path = std::env::temp_dir().join(format!("relay-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"bind": "127.0.0.1:9200", "broadcast_presence": false}"#).unwrap();

        let config = ServerConfig::from_args(&args(&[
            "--config",
            path.to_str().unwrap(),
            "--bind",
            "127.0.0.1:9300",
        ]))
        .unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.bind, "127.0.0.1:9300".parse().unwrap());
        assert!(!config.broadcast_presence);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            ServerConfig::from_args(&args(&["--bind", "nowhere"])),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_args(&args(&["--max-line-bytes", "8"])),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_args(&args(&["--config", "/nonexistent/relay.json"])),
            Err(ConfigError::Io(_))
        ));
    }
}
