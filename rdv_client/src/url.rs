//! Server endpoint addresses.
//!
//! An rdv endpoint is `http://host[:port][/prefix]` or `https://...`; a
//! bare `host[:port]` is treated as plain http. Parsing is delegated to
//! [`url::Url`]; only the pieces rdv needs are kept.

use crate::Error;
use rdv_protocol::path_escape;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scheme {
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerUrl {
    pub scheme: Scheme,
    /// Host name or IP literal, without brackets.
    pub host: String,
    pub port: u16,
    /// Path prefix under which the rdv endpoint is mounted, without a
    /// trailing slash. May be empty.
    pub path: String,
}

impl ServerUrl {
    pub(crate) fn parse(addr: &str) -> Result<ServerUrl, Error> {
        let text = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        let url: Url = text
            .parse()
            .map_err(|err: url::ParseError| Error::InvalidUrl(format!("{addr}: {err}")))?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(Error::InvalidUrl(format!("unexpected scheme [{other}]"))),
        };
        let host = match url.host() {
            Some(url::Host::Domain(domain)) => domain.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(Error::InvalidUrl(format!("missing host [{addr}]"))),
        };
        let port = url.port_or_known_default().unwrap_or(match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        });
        Ok(ServerUrl {
            scheme,
            host,
            port,
            path: url.path().trim_end_matches('/').to_string(),
        })
    }

    /// The request path for a given token: the mount prefix plus one
    /// percent-escaped path segment.
    pub(crate) fn request_path(&self, token: &str) -> String {
        format!("{}/{}", self.path, path_escape(token))
    }

    /// Value for the `Host` header. The port is included when it differs
    /// from the scheme default.
    pub(crate) fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let default_port = match self.scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        let url = ServerUrl::parse("http://example.com:8686").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 8686);
        assert_eq!(url.request_path("a b"), "/a%20b");
        assert_eq!(url.host_header(), "example.com:8686");

        let url = ServerUrl::parse("https://example.com/rdv/").unwrap();
        assert_eq!(url.scheme, Scheme::Https);
        assert_eq!(url.port, 443);
        assert_eq!(url.request_path("t"), "/rdv/t");
        assert_eq!(url.host_header(), "example.com");

        let url = ServerUrl::parse("127.0.0.1:8686").unwrap();
        assert_eq!(url.scheme, Scheme::Http);
        assert_eq!(url.port, 8686);

        let url = ServerUrl::parse("[::1]:8686").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.host_header(), "[::1]:8686");
    }

    #[test]
    fn rejects_malformed() {
        assert!(ServerUrl::parse("ftp://example.com").is_err());
        assert!(ServerUrl::parse("http://").is_err());
        assert!(ServerUrl::parse("http://example.com:notaport").is_err());
        assert!(ServerUrl::parse("http://[::1:8686").is_err());
    }
}
