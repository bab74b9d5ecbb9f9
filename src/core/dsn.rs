/// Connection-string parsing on top of `url::Url`
///
/// Only the parts the layer needs are extracted: the network endpoint for
/// reachability checks, decoded credentials for the Redis handshake, and a
/// redacted form for logs. Drivers receive the raw DSN untouched.
use crate::error::ConfigError;
use std::fmt;
use url::{Host, Url};

/// Scheme substituted for bare `host:port` strings so `Url` can parse them
const BARE_SCHEME: &str = "tcp";
const MASK: &str = "***";

/// Parsed connection string of the form `scheme://[user[:password]@]host[:port][/path][?query]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    pub scheme: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub path: Option<String>,
    url: Url,
}

impl Dsn {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ConfigError::ValidationError("DSN cannot be empty".to_string()));
        }

        let bare = !input.contains("://");
        let url = if bare {
            Url::parse(&format!("{}://{}", BARE_SCHEME, input))
        } else {
            Url::parse(input)
        }
        .map_err(|e| ConfigError::ValidationError(format!("Invalid DSN {}: {}", redact(input), e)))?;

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "DSN is missing a host: {}",
                    redact(input)
                )))
            }
        };

        let username = decode_userinfo(url.username())?;
        let password = match url.password() {
            Some(raw) => decode_userinfo(raw)?,
            None => None,
        };
        let path = url.path().trim_start_matches('/');

        Ok(Self {
            scheme: (!bare).then(|| url.scheme().to_string()),
            username,
            password,
            host,
            port: url.port(),
            path: (!path.is_empty()).then(|| path.to_string()),
            url,
        })
    }

    /// Well-known port for the DSN scheme
    pub fn default_port(&self) -> Option<u16> {
        match self.scheme.as_deref() {
            Some("postgres") | Some("postgresql") => Some(5432),
            Some("mysql") | Some("mariadb") => Some(3306),
            Some("redis") => Some(6379),
            Some("mongodb") => Some(27017),
            _ => None,
        }
    }

    /// `host:port` suitable for `TcpStream::connect`
    pub fn endpoint(&self) -> Result<String, ConfigError> {
        let port = self.port.or_else(|| self.default_port()).ok_or_else(|| {
            ConfigError::ValidationError(format!("DSN for host {} has no port", self.host))
        })?;

        if self.host.contains(':') {
            Ok(format!("[{}]:{}", self.host, port))
        } else {
            Ok(format!("{}:{}", self.host, port))
        }
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = masked(&self.url);
        match self.scheme {
            Some(_) => write!(f, "{}", shown),
            None => write!(f, "{}", strip_bare_scheme(&shown)),
        }
    }
}

/// Redacted form of a DSN for logs; the password is masked, never echoed
pub fn redact(input: &str) -> String {
    let input = input.trim();
    if input.contains("://") {
        match Url::parse(input) {
            Ok(url) => masked(&url),
            Err(_) => format!("<invalid dsn: {}>", input.split("://").next().unwrap_or_default()),
        }
    } else {
        match Url::parse(&format!("{}://{}", BARE_SCHEME, input)) {
            Ok(url) => strip_bare_scheme(&masked(&url)).to_string(),
            Err(_) => "<invalid dsn>".to_string(),
        }
    }
}

fn masked(url: &Url) -> String {
    let mut shown = url.clone();
    if shown.password().is_some() && shown.set_password(Some(MASK)).is_err() {
        return format!("{}://{}", url.scheme(), MASK);
    }
    shown.to_string()
}

fn strip_bare_scheme(shown: &str) -> &str {
    shown
        .strip_prefix(BARE_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))
        .unwrap_or(shown)
}

fn decode_userinfo(raw: &str) -> Result<Option<String>, ConfigError> {
    if raw.is_empty() {
        return Ok(None);
    }
    urlencoding::decode(raw)
        .map(|decoded| Some(decoded.into_owned()))
        .map_err(|_| ConfigError::ValidationError("DSN credentials are not valid UTF-8".to_string()))
}
