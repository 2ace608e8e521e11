//! Network locations with any-port equality.

use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::{NetError, NetResult};

/// Sentinel port meaning "any port".
///
/// Inbound peer connections arrive from an ephemeral source port, so the
/// allow-list stores any-port locations and matches on the address alone.
pub const PORT_ANY: u16 = 0;

/// A resolved network location.
///
/// Equality ignores the port when either side carries [`PORT_ANY`]; the
/// hash covers only the address so both forms land in the same map bucket.
#[derive(Debug, Clone, Eq)]
pub struct Location {
    addr: IpAddr,
    port: u16,
}

impl Location {
    /// Creates a location from a resolved address and port.
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Resolves a hostname to an IPv4 location.
    pub fn resolve(host: &str, port: u16) -> NetResult<Self> {
        let mut candidates = (host, port).to_socket_addrs().map_err(|_| NetError::Resolve {
            host: host.to_string(),
        })?;
        candidates
            .find(|addr| addr.is_ipv4())
            .map(|addr| Self::new(addr.ip(), port))
            .ok_or_else(|| NetError::Resolve {
                host: host.to_string(),
            })
    }

    /// Creates a location from an already-connected socket address.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }

    /// Parses a `host[:port]` entry and resolves the host.
    ///
    /// A missing port falls back to `default_port`; with no default, the
    /// port is required. Port 0 is rejected.
    pub fn parse(entry: &str, default_port: Option<u16>) -> NetResult<Self> {
        let entry = entry.trim();
        let bad = || NetError::BadLocation {
            entry: entry.to_string(),
        };

        let (host, port) = match entry.split_once(':') {
            Some((host, port_text)) => {
                let port: u16 = port_text.parse().map_err(|_| bad())?;
                (host, port)
            }
            None => (entry, default_port.ok_or_else(|| bad())?),
        };
        if host.is_empty() || port == PORT_ANY {
            return Err(bad());
        }
        Self::resolve(host, port)
    }

    /// Returns this location with the port replaced by [`PORT_ANY`].
    pub fn any_port(&self) -> Self {
        Self::new(self.addr, PORT_ANY)
    }

    /// Returns the address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the location as a connectable socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
            && (self.port == other.port || self.port == PORT_ANY || other.port == PORT_ANY)
    }
}

impl Hash for Location {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The port must stay out of the hash so that any-port and
        // fixed-port forms of one address collide.
        self.addr.hash(state);
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == PORT_ANY {
            write!(f, "{}:*", self.addr)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// Returns the local machine's outward-facing address, if discoverable.
///
/// Used only to filter this node out of a shared peer list; failure just
/// means the localhost comparison alone decides.
pub(crate) fn local_address() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 53)).ok()?;
    socket.local_addr().map(|addr| addr.ip()).ok()
}
