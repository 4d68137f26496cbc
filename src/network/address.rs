use crate::{Error, Result};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use url::Url;

const DEFAULT_PORT: u16 = 6379;

/// Canonical network address of a Redis node.
///
/// Accepted input forms: `sock://host:port` (the canonical URL) and the bare
/// `host:port` shape used by `MOVED`/`ASK` redirections and `CLUSTER SLOTS`
/// replies. Comparable by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Canonical URL form.
    pub fn url(&self) -> String {
        format!("sock://{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(str: &str) -> Result<Address> {
        if str.contains("://") {
            let url =
                Url::parse(str).map_err(|e| Error::Config(format!("invalid address {str}: {e}")))?;
            if url.scheme() != "sock" {
                return Err(Error::Config(format!(
                    "unsupported address scheme: {}",
                    url.scheme()
                )));
            }
            let host = url
                .host_str()
                .ok_or_else(|| Error::Config(format!("missing host in {str}")))?;
            Ok(Address::new(host, url.port().unwrap_or(DEFAULT_PORT)))
        } else {
            match str.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| Error::Config(format!("invalid port in {str}")))?;
                    Ok(Address::new(host, port))
                }
                None => Ok(Address::new(str, DEFAULT_PORT)),
            }
        }
    }
}

impl From<(String, u16)> for Address {
    fn from((host, port): (String, u16)) -> Self {
        Address::new(host, port)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        let a: Address = "sock://redis-0.example.com:7000".parse().unwrap();
        assert_eq!(Address::new("redis-0.example.com", 7000), a);
        assert_eq!("sock://redis-0.example.com:7000", a.url());

        let b: Address = "127.0.0.1:6380".parse().unwrap();
        assert_eq!(Address::new("127.0.0.1", 6380), b);

        let c: Address = "sock://localhost".parse().unwrap();
        assert_eq!(6379, c.port);

        assert!("http://x:1".parse::<Address>().is_err());
        assert!("host:notaport".parse::<Address>().is_err());
    }
}
