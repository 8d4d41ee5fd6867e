//! Negotiation fallback sequence.
//!
//! A session is driven through an ordered sequence of connection
//! strategies until one produces a usable socket:
//!
//! ```text
//! NEW → TRY_DIRECT → TRY_INCOMING → TRY_RELAY → {CONNECTED | FAILED}
//! ```
//!
//! 1. Connect straight to the remote user's verified and client-reported
//!    addresses, in parallel, taking whichever completes first.
//! 2. Open a listener and ask the remote user to connect to us.
//! 3. Meet at an intermediate relay server.
//!
//! Each strategy is attempted at most once per candidate set; a control
//! message carrying fresh candidates re-enters the sequence at the first
//! untried strategy. [`next_strategy`] only sequences: the actual connects,
//! binds, and timers are executed by the engine, and completion events feed
//! back in as further `next_strategy` calls.

use std::net::SocketAddr;

use crate::config::Config;
use crate::session::PeerSession;

/// Where a session currently is in the fallback sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    TryDirect,
    TryIncoming,
    TryRelay,
    Connected,
    Failed,
}

/// The next connection strategy the engine should execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Parallel outbound connects; `client` is absent when unknown or
    /// identical to the verified address.
    Direct {
        verified: SocketAddr,
        client: Option<SocketAddr>,
    },
    /// Open a listener on the configured port range and propose that the
    /// remote side connect to us.
    Incoming,
    /// Meet at the relay rendezvous point.
    Relay { addr: SocketAddr },
    /// Every strategy has been attempted.
    GiveUp,
}

/// Pick the first untried strategy for `session`, marking it tried and
/// updating the session state.
///
/// The caller must have closed any remnants of the previous attempt before
/// calling this.
pub fn next_strategy(session: &mut PeerSession, config: &Config) -> Strategy {
    let relay_only = session.use_relay || config.always_use_relay;

    // 1. Connect to the remote user's verified and client addresses at the
    //    same time and use whichever succeeds first.
    if !session.tried_direct && session.port != 0 && !relay_only {
        if let Some(verified_ip) = session.verified_ip {
            session.tried_direct = true;
            session.state = NegotiationState::TryDirect;

            let verified = SocketAddr::new(verified_ip, session.port);
            let client = session
                .client_ip
                .filter(|ip| *ip != verified_ip)
                .map(|ip| SocketAddr::new(ip, session.port));

            return Strategy::Direct { verified, client };
        }
    }

    // 2. Ask the remote user to connect to us.
    if !session.tried_incoming && !relay_only {
        session.tried_incoming = true;
        // Whoever connects must prove itself with the session cookie.
        session.is_incoming = true;
        session.state = NegotiationState::TryIncoming;
        return Strategy::Incoming;
    }

    // 3. Have both users meet at an intermediate relay.
    if !session.tried_relay {
        session.tried_relay = true;
        if !session.use_relay {
            // We initiate the relay leg, so the party that shows up there
            // could be anyone; demand the cookie check.
            session.is_incoming = true;
        }
        session.state = NegotiationState::TryRelay;

        let ip = session.relay_ip.unwrap_or_else(|| config.relay_addr.ip());
        let port = session.relay_port.unwrap_or_else(|| config.relay_addr.port());
        return Strategy::Relay {
            addr: SocketAddr::new(ip, port),
        };
    }

    session.state = NegotiationState::Failed;
    Strategy::GiveUp
}

/// Merge a re-proposal's candidate set into the session so the sequence can
/// be re-entered at the first untried strategy.
pub fn merge_candidates(session: &mut PeerSession, proposal: &crate::proposal::Proposal) {
    session.verified_ip = proposal.verified_ip;
    session.client_ip = proposal.client_ip;
    session.port = proposal.port;
    session.relay_ip = if proposal.use_relay { proposal.relay_ip } else { None };
    session.relay_port = if proposal.use_relay { proposal.relay_port } else { None };
    // Sticky: once either side wants the relay, stay on it.
    session.use_relay |= proposal.use_relay;
    session.request_number = proposal.request_number;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::Cookie;
    use crate::proposal::Proposal;
    use crate::session::Capability;
    use std::net::{IpAddr, Ipv4Addr};

    fn session_with_candidates() -> PeerSession {
        let mut s = PeerSession::new(
            1,
            Capability::DirectMessage,
            "buddy",
            Cookie::from_bytes(*b"AAAABBBB"),
        );
        s.verified_ip = Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)));
        s.client_ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        s.relay_ip = Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)));
        s.port = 5190;
        s
    }

    #[test]
    fn test_fallback_ordering() {
        // With valid data for all three strategies, the order is
        // direct, incoming, relay, give up.
        let mut s = session_with_candidates();
        let config = Config::default();

        assert!(matches!(
            next_strategy(&mut s, &config),
            Strategy::Direct { .. }
        ));
        assert_eq!(s.state(), NegotiationState::TryDirect);

        assert_eq!(next_strategy(&mut s, &config), Strategy::Incoming);
        assert_eq!(s.state(), NegotiationState::TryIncoming);

        assert!(matches!(
            next_strategy(&mut s, &config),
            Strategy::Relay { .. }
        ));
        assert_eq!(s.state(), NegotiationState::TryRelay);

        assert_eq!(next_strategy(&mut s, &config), Strategy::GiveUp);
        assert_eq!(s.state(), NegotiationState::Failed);
    }

    #[test]
    fn test_direct_uses_both_addresses() {
        let mut s = session_with_candidates();
        match next_strategy(&mut s, &Config::default()) {
            Strategy::Direct { verified, client } => {
                assert_eq!(verified, "198.51.100.1:5190".parse().unwrap());
                assert_eq!(client, Some("10.0.0.5:5190".parse().unwrap()));
            }
            other => panic!("expected direct strategy, got {:?}", other),
        }
    }

    #[test]
    fn test_direct_skips_duplicate_client_address() {
        let mut s = session_with_candidates();
        s.client_ip = s.verified_ip;
        match next_strategy(&mut s, &Config::default()) {
            Strategy::Direct { client, .. } => assert_eq!(client, None),
            other => panic!("expected direct strategy, got {:?}", other),
        }
    }

    #[test]
    fn test_direct_skipped_without_verified_address() {
        let mut s = session_with_candidates();
        s.verified_ip = None;
        assert_eq!(next_strategy(&mut s, &Config::default()), Strategy::Incoming);
        // The direct strategy stays untried so fresh candidates can
        // re-enable it later.
        assert!(!s.tried_direct);
    }

    #[test]
    fn test_direct_skipped_without_port() {
        let mut s = session_with_candidates();
        s.port = 0;
        assert_eq!(next_strategy(&mut s, &Config::default()), Strategy::Incoming);
    }

    #[test]
    fn test_relay_only_policy_goes_straight_to_relay() {
        let mut s = session_with_candidates();
        s.use_relay = true;
        match next_strategy(&mut s, &Config::default()) {
            Strategy::Relay { addr } => {
                assert_eq!(addr, "203.0.113.9:5190".parse().unwrap());
            }
            other => panic!("expected relay strategy, got {:?}", other),
        }
        // The remote supplied the relay, so we are not the verifying side.
        assert!(!s.is_incoming);
    }

    #[test]
    fn test_forced_relay_config() {
        let mut s = session_with_candidates();
        let config = Config {
            always_use_relay: true,
            ..Config::default()
        };
        assert!(matches!(next_strategy(&mut s, &config), Strategy::Relay { .. }));
        // Locally forced relay: the other party must still prove itself.
        assert!(s.is_incoming);
    }

    #[test]
    fn test_relay_falls_back_to_configured_default() {
        let mut s = session_with_candidates();
        s.tried_direct = true;
        s.tried_incoming = true;
        s.relay_ip = None;
        let config = Config::default();
        match next_strategy(&mut s, &config) {
            Strategy::Relay { addr } => assert_eq!(addr, config.relay_addr),
            other => panic!("expected relay strategy, got {:?}", other),
        }
    }

    #[test]
    fn test_incoming_marks_cookie_check_required() {
        let mut s = session_with_candidates();
        s.tried_direct = true;
        assert_eq!(next_strategy(&mut s, &Config::default()), Strategy::Incoming);
        assert!(s.is_incoming);
    }

    #[test]
    fn test_merge_candidates_reenters_at_first_untried() {
        let mut s = session_with_candidates();
        s.verified_ip = None;
        s.client_ip = None;
        s.port = 0;
        let config = Config::default();

        // No candidates: direct is skipped without being marked tried.
        assert_eq!(next_strategy(&mut s, &config), Strategy::Incoming);

        // A re-proposal with fresh addresses re-enables direct.
        let proposal = Proposal {
            cookie: s.cookie,
            capability: s.capability,
            status: crate::proposal::RendezvousStatus::Propose,
            verified_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))),
            client_ip: None,
            port: 5191,
            relay_ip: None,
            relay_port: None,
            use_relay: false,
            request_number: 2,
            file: None,
        };
        merge_candidates(&mut s, &proposal);
        assert_eq!(s.request_number, 2);

        match next_strategy(&mut s, &config) {
            Strategy::Direct { verified, client } => {
                assert_eq!(verified, "192.0.2.7:5191".parse().unwrap());
                assert_eq!(client, None);
            }
            other => panic!("expected direct strategy, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_candidates_relay_is_sticky() {
        let mut s = session_with_candidates();
        let proposal = Proposal {
            cookie: s.cookie,
            capability: s.capability,
            status: crate::proposal::RendezvousStatus::Propose,
            verified_ip: None,
            client_ip: None,
            port: 0,
            relay_ip: Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 50))),
            relay_port: Some(5190),
            use_relay: true,
            request_number: 3,
            file: None,
        };
        merge_candidates(&mut s, &proposal);
        assert!(s.use_relay);

        // Direct and incoming are now skipped even though untried.
        match next_strategy(&mut s, &Config::default()) {
            Strategy::Relay { addr } => {
                assert_eq!(addr, "203.0.113.50:5190".parse().unwrap());
            }
            other => panic!("expected relay strategy, got {:?}", other),
        }
    }
}
