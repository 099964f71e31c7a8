//! `nfs://host[:port][/path][?proto=tcp|udp]` URLs.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::protocol::rpc::TransportKind;
use crate::xdr::nfs3::NFS_PORT;

/// A file on an NFS server.
///
/// The path is kept as `/`-separated components without leading or
/// trailing separators; `.` components are dropped and `..` removes the
/// previous one. The empty path names the root of the server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NfsUrl {
    host: String,
    port: u16,
    path: String,
    transport: Option<TransportKind>,
}

impl NfsUrl {
    pub fn new(host: impl Into<String>, port: u16, path: &str) -> Self {
        Self { host: host.into(), port, path: normalize(path), transport: None }
    }

    pub fn parse(url: &str) -> Result<Self> {
        let invalid =
            |reason: &str| Error::InvalidUrl { url: url.to_string(), reason: reason.to_string() };

        let rest = match url.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("nfs") => rest,
            Some(_) => return Err(invalid("scheme must be nfs")),
            None => return Err(invalid("missing nfs:// prefix")),
        };

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, ""),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) =
                bracketed.split_once(']').ok_or_else(|| invalid("unclosed IPv6 address"))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(invalid("garbage after IPv6 address")),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid("bad port"))?,
            None => NFS_PORT,
        };

        let mut transport = None;
        for param in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            match param.split_once('=') {
                Some(("proto", value)) => {
                    transport = Some(match value.to_ascii_lowercase().as_str() {
                        "tcp" => TransportKind::Tcp,
                        "udp" => TransportKind::Udp,
                        _ => return Err(invalid("proto must be tcp or udp")),
                    });
                }
                _ => return Err(invalid("unknown query parameter")),
            }
        }

        Ok(Self { host: host.to_string(), port, path: normalize(path), transport })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path relative to the server root, without a leading `/`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Transport requested by the URL, if any.
    pub fn transport(&self) -> Option<TransportKind> {
        self.transport
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = Some(transport);
        self
    }

    /// `host:port`, the key of everything cached per server.
    pub fn server(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|c| !c.is_empty())
    }

    /// Last path component; empty for the root.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    pub fn parent(&self) -> Option<NfsUrl> {
        if self.is_root() {
            return None;
        }
        let path = self.path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or_default();
        Some(Self { path: path.to_string(), ..self.clone() })
    }

    pub fn join(&self, name: &str) -> NfsUrl {
        Self { path: normalize(&format!("{}/{}", self.path, name)), ..self.clone() }
    }
}

fn normalize(path: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }
    components.join("/")
}

impl FromStr for NfsUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for NfsUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nfs://{}/{}", self.server(), self.path)?;
        if let Some(transport) = self.transport {
            write!(f, "?proto={transport}")?;
        }
        Ok(())
    }
}
