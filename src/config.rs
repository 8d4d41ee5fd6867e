//! Engine configuration.
//!
//! The timeout and port values here are environment constants that vary by
//! deployment; they are kept as named, overridable fields rather than
//! literals scattered through the negotiation code.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Default bound on a single direct-connect round.
///
/// Waiting for the OS to time out a connect is not practical (several
/// minutes on some systems) and users are impatient. Five seconds bounds the
/// worst case to roughly two fallback rounds while still covering ordinary
/// broadband RTT plus connect overhead.
pub const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default port range scanned when opening a listener for an inbound peer.
pub const DEFAULT_LISTEN_PORTS: RangeInclusive<u16> = 5190..=5290;

/// Default relay rendezvous port.
pub const DEFAULT_RELAY_PORT: u16 = 5190;

/// Configuration for a [`RendezvousEngine`](crate::RendezvousEngine).
#[derive(Debug, Clone)]
pub struct Config {
    /// How long to wait on the parallel direct-connect attempts before
    /// falling back to the next strategy.
    pub direct_timeout: Duration,

    /// Port range scanned for the first bindable port when waiting for an
    /// inbound peer connection.
    pub listen_ports: RangeInclusive<u16>,

    /// Relay server used when neither side can accept a connection and the
    /// remote did not supply its own relay address.
    pub relay_addr: SocketAddr,

    /// Force every session through the relay, skipping the direct and
    /// listening strategies entirely.
    pub always_use_relay: bool,

    /// Address advertised to the remote side in "connect to me" proposals.
    /// Supplied by the enclosing account context (usually the local address
    /// of the server connection); NAT discovery is out of scope here.
    pub local_ip: IpAddr,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            direct_timeout: DEFAULT_DIRECT_TIMEOUT,
            listen_ports: DEFAULT_LISTEN_PORTS,
            relay_addr: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                DEFAULT_RELAY_PORT,
            ),
            always_use_relay: false,
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}
