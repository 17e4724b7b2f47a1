use std::fmt;

use http::Uri;

/// A destination host and port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPortPair {
    pub host: String,
    pub port: u16,
}

impl HostPortPair {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host and port of `uri`, using the scheme's default port when none is
    /// given. Returns `None` for relative uris and unknown schemes without a
    /// port.
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let host = uri.host()?;
        let port = match uri.port_u16() {
            Some(port) => port,
            None => match uri.scheme_str()? {
                "https" | "wss" => 443,
                "http" | "ws" => 80,
                _ => return None,
            },
        };
        Some(Self::new(host.to_ascii_lowercase(), port))
    }
}

impl fmt::Display for HostPortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How the session's connection reaches its destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum ProxyServer {
    #[default]
    Direct,
    Proxy(HostPortPair),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub enum PrivacyMode {
    #[default]
    Disabled,
    Enabled,
}

/// Identity of a session in the pool: destination, route and privacy mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub host_port: HostPortPair,
    pub proxy: ProxyServer,
    pub privacy_mode: PrivacyMode,
}

impl SessionKey {
    /// A direct, non-private key for `host_port`
    pub fn new(host_port: HostPortPair) -> Self {
        Self {
            host_port,
            proxy: ProxyServer::Direct,
            privacy_mode: PrivacyMode::Disabled,
        }
    }

    pub fn with_proxy(mut self, proxy: ProxyServer) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_privacy_mode(mut self, privacy_mode: PrivacyMode) -> Self {
        self.privacy_mode = privacy_mode;
        self
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host_port)?;
        if let ProxyServer::Proxy(proxy) = &self.proxy {
            write!(f, " via {proxy}")?;
        }
        if self.privacy_mode == PrivacyMode::Enabled {
            write!(f, " (private)")?;
        }
        Ok(())
    }
}

/// Whether any of the certificate's names covers `host`. A `*.` wildcard
/// stands for exactly one leftmost label.
pub(crate) fn certificate_covers(names: &[String], host: &str) -> bool {
    let host = host.trim_end_matches('.');
    names.iter().any(|name| {
        let name = name.trim_end_matches('.');
        if name.eq_ignore_ascii_case(host) {
            return true;
        }

        match name.strip_prefix("*.") {
            Some(suffix) => match host.split_once('.') {
                Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
                None => false,
            },
            None => false,
        }
    })
}
