use crate::{Error, Result, network::Address};
use std::time::Duration;

/// `sock://host:port` of the initial Redis node.
pub const DBR_SERVER_ENV: &str = "DBR_SERVER";
/// Path of the AUTH secret file; the literal value `NONE` disables AUTH.
pub const DBR_AUTHFILE_ENV: &str = "DBR_AUTHFILE";
/// Blocking-operation timeout in seconds; `0` blocks forever.
pub const DBR_TIMEOUT_ENV: &str = "DBR_TIMEOUT";

const DEFAULT_SERVER: &str = "sock://localhost:6379";
const DEFAULT_AUTHFILE: &str = ".redis.auth";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client configuration, usually taken from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: Address,
    pub authfile: String,
    /// zero means "never time out"
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.parse().expect("default server address"),
            authfile: DEFAULT_AUTHFILE.to_owned(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Config {
    /// Builds the configuration from `DBR_SERVER`, `DBR_AUTHFILE` and
    /// `DBR_TIMEOUT`, with the documented defaults for unset variables.
    pub fn from_env() -> Result<Config> {
        let mut config = Config::default();

        if let Ok(server) = std::env::var(DBR_SERVER_ENV) {
            config.server = server.parse()?;
        }
        if let Ok(authfile) = std::env::var(DBR_AUTHFILE_ENV) {
            config.authfile = authfile;
        }
        if let Ok(timeout) = std::env::var(DBR_TIMEOUT_ENV) {
            let seconds = timeout
                .parse::<u64>()
                .map_err(|_| Error::Config(format!("invalid {DBR_TIMEOUT_ENV}: {timeout}")))?;
            config.timeout = Duration::from_secs(seconds);
        }

        Ok(config)
    }
}
