use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

/// Agent service configuration. Precedence: built-in defaults, then the
/// config file, then `DMS_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// AMQP URL of the message broker.
    pub broker_url: String,
    /// Ledger database URL. Read by the client-side coordinator only;
    /// the agent carries it so one config file serves both sides.
    pub ledger_url: Option<Url>,
    /// Node identity; names this agent's inbound queue.
    ///  Defaults to the hostname.
    pub node_id: String,
    /// Base URL of the secret/identity service.
    pub auth_url: Url,
    /// Base directory for mount points created on demand.
    pub mount_base_path: PathBuf,
    /// On-disk registry of FUSE helper PID files.
    pub pid_dir: PathBuf,
    /// Directory holding the host mount lock.
    pub lock_dir: PathBuf,
    /// Budget for acquiring the host mount lock (coordinator side).
    pub lock_timeout: Duration,
    /// Budget for one mount RPC round trip (coordinator side).
    pub rpc_timeout: Duration,
    /// FUSE helper binary spawned per mounted S3 target.
    pub fuse_binary_path: PathBuf,
    /// Privileged helper invoked for NFS mounts.
    pub privileged_mount_helper_path: PathBuf,
    /// Optional helper configuration file, exported to the helper's
    ///  environment when set.
    pub privileged_mount_helper_conf: Option<PathBuf>,
    pub log_level: tracing::Level,
    /// Directory for log files (logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: "amqp://127.0.0.1:5672/%2f".to_string(),
            ledger_url: None,
            node_id: default_node_id(),
            auth_url: Url::parse("http://127.0.0.1:9311").expect("static default url"),
            mount_base_path: PathBuf::from("/var/lib/dms/mounts"),
            pid_dir: PathBuf::from("/run/dms/s3"),
            lock_dir: PathBuf::from("/run/dms"),
            lock_timeout: Duration::from_secs(300),
            rpc_timeout: Duration::from_secs(60),
            fuse_binary_path: PathBuf::from("/usr/local/bin/dms-s3fs"),
            privileged_mount_helper_path: PathBuf::from("/usr/bin/mount"),
            privileged_mount_helper_conf: None,
            log_level: tracing::Level::INFO,
            log_dir: None,
        }
    }
}

/// On-disk config shape; every key optional so the file only has to name
/// what it overrides.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    broker_url: Option<String>,
    ledger_url: Option<String>,
    node_id: Option<String>,
    auth_url: Option<String>,
    mount_base_path: Option<PathBuf>,
    pid_dir: Option<PathBuf>,
    lock_dir: Option<PathBuf>,
    lock_timeout_seconds: Option<u64>,
    rpc_timeout_seconds: Option<u64>,
    fuse_binary_path: Option<PathBuf>,
    privileged_mount_helper_path: Option<PathBuf>,
    privileged_mount_helper_conf: Option<PathBuf>,
    log_level: Option<String>,
    log_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration: defaults, overlaid with the file at `path`
    /// (when present), overlaid with `DMS_*` environment variables.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
            let file: ConfigFile =
                toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
            config.apply_file(file)?;
        }

        let env: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with("DMS_"))
            .collect();
        config.apply_env(&env)?;

        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) -> Result<(), ConfigError> {
        if let Some(v) = file.broker_url {
            self.broker_url = v;
        }
        if let Some(v) = file.ledger_url {
            self.ledger_url = Some(parse_url("ledger_url", &v)?);
        }
        if let Some(v) = file.node_id {
            self.node_id = v;
        }
        if let Some(v) = file.auth_url {
            self.auth_url = parse_url("auth_url", &v)?;
        }
        if let Some(v) = file.mount_base_path {
            self.mount_base_path = v;
        }
        if let Some(v) = file.pid_dir {
            self.pid_dir = v;
        }
        if let Some(v) = file.lock_dir {
            self.lock_dir = v;
        }
        if let Some(v) = file.lock_timeout_seconds {
            self.lock_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.rpc_timeout_seconds {
            self.rpc_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.fuse_binary_path {
            self.fuse_binary_path = v;
        }
        if let Some(v) = file.privileged_mount_helper_path {
            self.privileged_mount_helper_path = v;
        }
        if let Some(v) = file.privileged_mount_helper_conf {
            self.privileged_mount_helper_conf = Some(v);
        }
        if let Some(v) = file.log_level {
            self.log_level = parse_level(&v)?;
        }
        if let Some(v) = file.log_dir {
            self.log_dir = Some(v);
        }
        Ok(())
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(v) = env.get("DMS_BROKER_URL") {
            self.broker_url = v.clone();
        }
        if let Some(v) = env.get("DMS_LEDGER_URL") {
            self.ledger_url = Some(parse_url("DMS_LEDGER_URL", v)?);
        }
        if let Some(v) = env.get("DMS_NODE_ID") {
            self.node_id = v.clone();
        }
        if let Some(v) = env.get("DMS_AUTH_URL") {
            self.auth_url = parse_url("DMS_AUTH_URL", v)?;
        }
        if let Some(v) = env.get("DMS_MOUNT_BASE_PATH") {
            self.mount_base_path = PathBuf::from(v);
        }
        if let Some(v) = env.get("DMS_PID_DIR") {
            self.pid_dir = PathBuf::from(v);
        }
        if let Some(v) = env.get("DMS_LOCK_DIR") {
            self.lock_dir = PathBuf::from(v);
        }
        if let Some(v) = env.get("DMS_LOCK_TIMEOUT_SECONDS") {
            self.lock_timeout = Duration::from_secs(parse_seconds("DMS_LOCK_TIMEOUT_SECONDS", v)?);
        }
        if let Some(v) = env.get("DMS_RPC_TIMEOUT_SECONDS") {
            self.rpc_timeout = Duration::from_secs(parse_seconds("DMS_RPC_TIMEOUT_SECONDS", v)?);
        }
        if let Some(v) = env.get("DMS_FUSE_BINARY_PATH") {
            self.fuse_binary_path = PathBuf::from(v);
        }
        if let Some(v) = env.get("DMS_PRIVILEGED_MOUNT_HELPER_PATH") {
            self.privileged_mount_helper_path = PathBuf::from(v);
        }
        if let Some(v) = env.get("DMS_PRIVILEGED_MOUNT_HELPER_CONF") {
            self.privileged_mount_helper_conf = Some(PathBuf::from(v));
        }
        if let Some(v) = env.get("DMS_LOG_LEVEL") {
            self.log_level = parse_level(v)?;
        }
        if let Some(v) = env.get("DMS_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }
}

fn default_node_id() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn parse_url(key: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_seconds(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_level(value: &str) -> Result<tracing::Level, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: "log_level".to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.pid_dir, PathBuf::from("/run/dms/s3"));
        assert_eq!(config.lock_timeout, Duration::from_secs(300));
        assert_eq!(config.rpc_timeout, Duration::from_secs(60));
        assert!(!config.node_id.is_empty());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut config = Config::default();
        let file: ConfigFile = toml::from_str(
            r#"
            broker_url = "amqp://broker.internal:5672/%2f"
            node_id = "worker-07"
            lock_timeout_seconds = 120
            log_level = "debug"
            "#,
        )
        .unwrap();
        config.apply_file(file).unwrap();

        assert_eq!(config.broker_url, "amqp://broker.internal:5672/%2f");
        assert_eq!(config.node_id, "worker-07");
        assert_eq!(config.lock_timeout, Duration::from_secs(120));
        assert_eq!(config.log_level, tracing::Level::DEBUG);
        // Untouched keys keep their defaults.
        assert_eq!(config.rpc_timeout, Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_file() {
        let mut config = Config::default();
        let file: ConfigFile = toml::from_str(r#"node_id = "from-file""#).unwrap();
        config.apply_file(file).unwrap();

        let env = HashMap::from([
            ("DMS_NODE_ID".to_string(), "from-env".to_string()),
            ("DMS_RPC_TIMEOUT_SECONDS".to_string(), "15".to_string()),
            ("DMS_LEDGER_URL".to_string(), "sqlite:///var/lib/dms/ledger.db".to_string()),
        ]);
        config.apply_env(&env).unwrap();

        assert_eq!(config.node_id, "from-env");
        assert_eq!(config.rpc_timeout, Duration::from_secs(15));
        assert!(config.ledger_url.is_some());
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut config = Config::default();

        let env = HashMap::from([("DMS_RPC_TIMEOUT_SECONDS".to_string(), "soon".to_string())]);
        assert!(matches!(
            config.apply_env(&env),
            Err(ConfigError::InvalidValue { .. })
        ));

        let env = HashMap::from([("DMS_LOG_LEVEL".to_string(), "loudest".to_string())]);
        assert!(matches!(
            config.apply_env(&env),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
