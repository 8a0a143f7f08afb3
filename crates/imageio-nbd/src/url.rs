//! NBD URL parsing.
//!
//! Accepts the three spellings seen in the wild:
//!
//! - `nbd:unix:/path/to/sock[:exportname=NAME]` (qemu traditional)
//! - `nbd+unix:///[NAME]?socket=/path/to/sock` (qemu URI)
//! - `nbd://host[:port][/NAME]` (TCP)

use std::path::PathBuf;

use imageio_proto::{Error, ImageResult};

use crate::proto::DEFAULT_PORT;

/// Where the NBD server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NbdAddress {
    Unix(PathBuf),
    Tcp(String, u16),
}

impl std::fmt::Display for NbdAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NbdAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            NbdAddress::Tcp(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Parsed NBD URL: server address plus export name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdUrl {
    pub address: NbdAddress,
    pub export: String,
}

impl NbdUrl {
    pub fn parse(s: &str) -> ImageResult<Self> {
        if let Some(rest) = s.strip_prefix("nbd:unix:") {
            return parse_qemu_unix(rest);
        }
        if let Some(rest) = s.strip_prefix("nbd+unix://") {
            return parse_uri_unix(rest);
        }
        if let Some(rest) = s.strip_prefix("nbd://") {
            return parse_tcp(rest);
        }
        Err(Error::BadRequest(format!("unsupported NBD url: {s:?}")))
    }
}

impl std::fmt::Display for NbdUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.address {
            NbdAddress::Unix(path) => {
                write!(f, "nbd:unix:{}", path.display())?;
                if !self.export.is_empty() {
                    write!(f, ":exportname={}", self.export)?;
                }
                Ok(())
            }
            NbdAddress::Tcp(host, port) => {
                write!(f, "nbd://{}:{}", host, port)?;
                if !self.export.is_empty() {
                    write!(f, "/{}", self.export)?;
                }
                Ok(())
            }
        }
    }
}

/// `/path[:exportname=NAME]`
fn parse_qemu_unix(rest: &str) -> ImageResult<NbdUrl> {
    let (path, export) = match rest.split_once(":exportname=") {
        Some((path, export)) => (path, export.to_string()),
        None => (rest, String::new()),
    };
    if path.is_empty() {
        return Err(Error::BadRequest("empty NBD socket path".into()));
    }
    Ok(NbdUrl {
        address: NbdAddress::Unix(PathBuf::from(path)),
        export,
    })
}

/// `/[NAME]?socket=/path`
fn parse_uri_unix(rest: &str) -> ImageResult<NbdUrl> {
    let (path_part, query) = rest
        .split_once('?')
        .ok_or_else(|| Error::BadRequest("nbd+unix url requires ?socket=".into()))?;

    let mut socket = None;
    let mut export = path_part.trim_start_matches('/').to_string();
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("socket", value)) => socket = Some(PathBuf::from(value)),
            Some(("export", value)) if export.is_empty() => export = value.to_string(),
            _ => {}
        }
    }

    let socket =
        socket.ok_or_else(|| Error::BadRequest("nbd+unix url requires ?socket=".into()))?;
    Ok(NbdUrl {
        address: NbdAddress::Unix(socket),
        export,
    })
}

/// `host[:port][/NAME]`
fn parse_tcp(rest: &str) -> ImageResult<NbdUrl> {
    let (authority, export) = match rest.split_once('/') {
        Some((authority, export)) => (authority, export.to_string()),
        None => (rest, String::new()),
    };

    let (host, port) = match authority.rsplit_once(':') {
        // Not a port separator if this looks like a bare IPv6 address.
        Some((host, port)) if !port.contains(']') => {
            let port = port
                .parse()
                .map_err(|_| Error::BadRequest(format!("invalid NBD port {port:?}")))?;
            (host, port)
        }
        _ => (authority, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(Error::BadRequest("empty NBD host".into()));
    }
    Ok(NbdUrl {
        address: NbdAddress::Tcp(host.trim_matches(|c| c == '[' || c == ']').to_string(), port),
        export,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qemu_unix() {
        let url = NbdUrl::parse("nbd:unix:/run/nbd.sock").unwrap();
        assert_eq!(url.address, NbdAddress::Unix(PathBuf::from("/run/nbd.sock")));
        assert_eq!(url.export, "");
    }

    #[test]
    fn test_qemu_unix_exportname() {
        let url = NbdUrl::parse("nbd:unix:/run/nbd.sock:exportname=sda").unwrap();
        assert_eq!(url.address, NbdAddress::Unix(PathBuf::from("/run/nbd.sock")));
        assert_eq!(url.export, "sda");
    }

    #[test]
    fn test_uri_unix() {
        let url = NbdUrl::parse("nbd+unix:///sda?socket=/run/nbd.sock").unwrap();
        assert_eq!(url.address, NbdAddress::Unix(PathBuf::from("/run/nbd.sock")));
        assert_eq!(url.export, "sda");
    }

    #[test]
    fn test_uri_unix_no_export() {
        let url = NbdUrl::parse("nbd+unix:///?socket=/run/nbd.sock").unwrap();
        assert_eq!(url.export, "");
    }

    #[test]
    fn test_tcp() {
        let url = NbdUrl::parse("nbd://server:10810/sda").unwrap();
        assert_eq!(url.address, NbdAddress::Tcp("server".into(), 10810));
        assert_eq!(url.export, "sda");
    }

    #[test]
    fn test_tcp_defaults() {
        let url = NbdUrl::parse("nbd://server").unwrap();
        assert_eq!(url.address, NbdAddress::Tcp("server".into(), DEFAULT_PORT));
        assert_eq!(url.export, "");
    }

    #[test]
    fn test_invalid() {
        assert!(NbdUrl::parse("file:///image").is_err());
        assert!(NbdUrl::parse("nbd:unix:").is_err());
        assert!(NbdUrl::parse("nbd://server:http").is_err());
        assert!(NbdUrl::parse("nbd+unix:///sda").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for s in [
            "nbd:unix:/run/nbd.sock",
            "nbd:unix:/run/nbd.sock:exportname=sda",
            "nbd://server:10809/sda",
        ] {
            let url = NbdUrl::parse(s).unwrap();
            assert_eq!(NbdUrl::parse(&url.to_string()).unwrap(), url);
        }
    }
}
