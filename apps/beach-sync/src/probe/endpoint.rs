use std::fmt;

use url::Url;

pub const HEALTH_PATH: &str = "_sync/health";
pub const CAPABILITY_PATH: &str = "_sync/host-config";
pub const STREAM_PATH: &str = "_sync/stream";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint cannot be empty")]
    Empty,
    #[error("invalid endpoint url {raw}: {reason}")]
    Invalid { raw: String, reason: String },
    #[error("unsupported endpoint scheme {0}")]
    UnsupportedScheme(String),
}

/// One candidate base location of the session host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: String,
    host: String,
    port: Option<u16>,
    path_prefix: String,
}

impl Endpoint {
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        port: Option<u16>,
        path_prefix: impl AsRef<str>,
    ) -> Result<Self, EndpointError> {
        let scheme = scheme.into().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(EndpointError::UnsupportedScheme(scheme));
        }
        let host = host.into();
        if host.trim().is_empty() {
            return Err(EndpointError::Empty);
        }
        Ok(Self {
            scheme,
            host,
            port,
            path_prefix: normalize_prefix(path_prefix.as_ref()),
        })
    }

    /// Parses `host[:port][/prefix]` or a full `http(s)://` url. A missing
    /// scheme is inferred: `http` for local and private hosts, `https`
    /// otherwise.
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EndpointError::Empty);
        }
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("{}{trimmed}", infer_scheme(trimmed))
        };
        let url = Url::parse(&with_scheme).map_err(|err| EndpointError::Invalid {
            raw: trimmed.to_string(),
            reason: err.to_string(),
        })?;
        let host = url.host_str().ok_or_else(|| EndpointError::Invalid {
            raw: trimmed.to_string(),
            reason: "missing host".into(),
        })?;
        Self::new(url.scheme(), host, url.port(), url.path())
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Prefix without a trailing slash; empty when the host serves at `/`.
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn health_url(&self) -> Result<Url, EndpointError> {
        self.url_for(&self.scheme, HEALTH_PATH)
    }

    pub fn capability_url(&self) -> Result<Url, EndpointError> {
        self.url_for(&self.scheme, CAPABILITY_PATH)
    }

    pub fn stream_url(&self) -> Result<Url, EndpointError> {
        let scheme = if self.scheme == "https" { "wss" } else { "ws" };
        self.url_for(scheme, STREAM_PATH)
    }

    fn url_for(&self, scheme: &str, path: &str) -> Result<Url, EndpointError> {
        let raw = format!("{scheme}://{}{}/{path}", self.authority(), self.path_prefix);
        Url::parse(&raw).map_err(|err| EndpointError::Invalid {
            raw,
            reason: err.to_string(),
        })
    }

    fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority(), self.path_prefix)
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    let private_172 = host_lower
        .strip_prefix("172.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|octet| octet.parse::<u8>().ok())
        .map(|octet| (16..32).contains(&octet))
        .unwrap_or(false);
    if host_lower.starts_with("localhost")
        || host_lower.starts_with("0.0.0.0")
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || private_172
    {
        "http://"
    } else {
        "https://"
    }
}
