//! The rendezvous engine.
//!
//! Owns the reactor, the session registry, and the seams to the outside
//! world (control channel, observer), and executes the negotiation
//! strategies chosen by [`crate::negotiate`]. Everything runs on the
//! caller's thread: the application repeatedly calls
//! [`RendezvousEngine::step`] to let readiness events, timer expirations,
//! and deferred teardowns make progress.
//!
//! Teardown discipline: helpers never destroy a session in place. They
//! return a [`Verdict`] that unwinds to the dispatch point, which removes
//! the session from the registry and releases its resources exactly once.
//! That keeps destruction out of the session's own callback stack.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Token};

use crate::config::Config;
use crate::cookie::Cookie;
use crate::error::{DisconnectReason, SendError};
use crate::frame::{self, ReadOutcome};
use crate::negotiate::{self, NegotiationState, Strategy};
use crate::proposal::{ControlChannel, Proposal, RendezvousStatus};
use crate::reactor::Reactor;
use crate::registry::SessionRegistry;
use crate::relay::{self, RelayHandshake, RelayProgress, RelayRole};
use crate::session::{Capability, FileInfo, PeerSession, Verdict};

// ============================================================================
// Observer Seam
// ============================================================================

/// Status callbacks delivered to the application.
///
/// `on_proposal` surfaces an inbound rendezvous request; the application
/// answers with [`RendezvousEngine::accept_proposal`] or
/// [`RendezvousEngine::reject_proposal`]. `on_disconnected` is the single
/// terminal notification per session.
pub trait RendezvousObserver {
    fn on_proposal(&mut self, from: &str, proposal: &Proposal);
    fn on_ready(&mut self, peer: &str, capability: Capability, cookie: &Cookie);
    fn on_frame(&mut self, peer: &str, capability: Capability, cookie: &Cookie, payload: &[u8]);
    fn on_disconnected(
        &mut self,
        peer: &str,
        capability: Capability,
        cookie: &Cookie,
        reason: DisconnectReason,
    );
}

/// Which parallel direct-connect attempt a readiness event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectSlot {
    Verified,
    Client,
}

/// Completion state of a non-blocking connect probed on writability.
enum ConnectStatus {
    Connected,
    Pending,
    Failed(io::Error),
}

/// One read attempt on the relay socket during setup.
enum HandshakeIo {
    /// One complete relay message, consumed exactly.
    Message(Vec<u8>),
    /// Not enough bytes buffered yet.
    Wait,
    /// The relay closed the connection.
    Closed,
    /// The relay announced a message no setup exchange would produce.
    Garbage,
    Error(io::Error),
}

// ============================================================================
// Engine
// ============================================================================

/// The peer-to-peer rendezvous connection engine for one account.
pub struct RendezvousEngine {
    config: Config,
    reactor: Reactor,
    registry: SessionRegistry,
    control: Box<dyn ControlChannel>,
    observer: Box<dyn RendezvousObserver>,
    /// Routes readiness tokens (sockets and timers) back to sessions.
    tokens: HashMap<Token, u64>,
    events: Events,
}

impl RendezvousEngine {
    pub fn new(
        config: Config,
        control: Box<dyn ControlChannel>,
        observer: Box<dyn RendezvousObserver>,
    ) -> io::Result<Self> {
        Ok(RendezvousEngine {
            config,
            reactor: Reactor::new()?,
            registry: SessionRegistry::new(),
            control,
            observer,
            tokens: HashMap::new(),
            events: Events::with_capacity(256),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Where the session with this cookie currently is in its fallback
    /// sequence, if it exists.
    pub fn session_state(&self, cookie: &Cookie) -> Option<NegotiationState> {
        self.registry.find_by_cookie(cookie).map(|s| s.state())
    }

    pub fn is_ready(&self, cookie: &Cookie) -> bool {
        self.registry
            .find_by_cookie(cookie)
            .map(|s| s.ready)
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Initiate a rendezvous with `peer`.
    ///
    /// For direct messaging, an existing ready session is reused and its
    /// cookie returned; a stale unfinished one is torn down first. File
    /// transfers always start a fresh session and require complete file
    /// metadata.
    pub fn propose(
        &mut self,
        capability: Capability,
        peer: &str,
        file: Option<FileInfo>,
    ) -> io::Result<Cookie> {
        match capability {
            Capability::DirectMessage => {
                if let Some(existing) = self.registry.find_by_peer(peer, capability) {
                    if existing.ready {
                        log::info!("already have a direct-message session with {}", peer);
                        return Ok(existing.cookie);
                    }
                    let stale = existing.id;
                    self.destroy_by_id(stale, DisconnectReason::Retrying);
                }
            }
            Capability::FileTransfer => match &file {
                Some(info) if info.is_complete() => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "file transfer requires name, size, and file count",
                    ))
                }
            },
        }

        let id = self.registry.next_id();
        let mut session = PeerSession::new(id, capability, peer, Cookie::generate());
        session.initiated_locally = true;
        session.approved = true;
        session.file = file;
        let cookie = session.cookie;

        log::info!(
            "proposing {} session with {} (cookie={})",
            capability,
            peer,
            cookie
        );

        match self.try_next(&mut session) {
            Verdict::Keep => self.registry.insert(session),
            Verdict::Destroy(reason) => self.finish_destroy(session, reason),
        }

        Ok(cookie)
    }

    /// The local user approved an inbound proposal: start negotiating.
    pub fn accept_proposal(&mut self, cookie: &Cookie) -> bool {
        let id = match self.registry.find_by_cookie(cookie) {
            Some(s) if !s.approved => s.id,
            _ => return false,
        };
        let Some(mut session) = self.registry.take(id) else {
            return false;
        };

        session.approved = true;
        match self.try_next(&mut session) {
            Verdict::Keep => self.registry.insert(session),
            Verdict::Destroy(reason) => self.finish_destroy(session, reason),
        }
        true
    }

    /// The local user declined an inbound proposal: tell the remote side
    /// and tear the pending session down.
    pub fn reject_proposal(&mut self, cookie: &Cookie) -> bool {
        let id = match self.registry.find_by_cookie(cookie) {
            Some(s) if !s.approved => s.id,
            _ => return false,
        };
        self.destroy_by_id(id, DisconnectReason::LocalClosed)
    }

    /// Close a session locally, whatever its state.
    pub fn close(&mut self, cookie: &Cookie) -> bool {
        let id = match self.registry.find_by_cookie(cookie) {
            Some(s) => s.id,
            None => return false,
        };
        self.destroy_by_id(id, DisconnectReason::LocalClosed)
    }

    /// Queue one frame of payload on a ready session.
    ///
    /// Queued bytes are drained as the socket accepts them; a session that
    /// dies before the queue empties reports through `on_disconnected`.
    pub fn send_frame(&mut self, cookie: &Cookie, payload: &[u8]) -> Result<(), SendError> {
        let id = match self.registry.find_by_cookie(cookie) {
            Some(s) if s.ready => s.id,
            Some(_) => return Err(SendError::NotReady),
            None => return Err(SendError::UnknownSession),
        };
        let Some(mut session) = self.registry.take(id) else {
            return Err(SendError::UnknownSession);
        };

        match frame::encode_frame(session.capability, payload) {
            Ok(bytes) => {
                session.outgoing.append(&bytes);
                match self.flush_outgoing(&mut session) {
                    Verdict::Keep => self.registry.insert(session),
                    Verdict::Destroy(reason) => self.finish_destroy(session, reason),
                }
                Ok(())
            }
            Err(e) => {
                self.registry.insert(session);
                Err(e.into())
            }
        }
    }

    /// Feed one inbound rendezvous control message into the engine.
    ///
    /// `from` is the authenticated sender identity reported by the server
    /// channel; a message is only ever attributed to a session when both
    /// the sender and the cookie match.
    pub fn handle_control_message(&mut self, from: &str, proposal: Proposal) {
        if let Err(e) = proposal.validate() {
            log::warn!("{} sent a malformed proposal: {}", from, e);
            return;
        }

        let existing = self
            .registry
            .find_by_peer_and_cookie(from, &proposal.cookie)
            .filter(|s| s.capability == proposal.capability)
            .map(|s| s.id);

        if let Some(id) = existing {
            match proposal.status {
                RendezvousStatus::Cancel => {
                    log::info!("{} cancelled the rendezvous {}", from, proposal.cookie);
                    self.destroy_by_id(id, DisconnectReason::RemoteRefused);
                }
                RendezvousStatus::Connected => {
                    log::debug!("{} reports its side of {} connected", from, proposal.cookie);
                }
                RendezvousStatus::Propose => {
                    let Some(mut session) = self.registry.take(id) else {
                        return;
                    };
                    if proposal.request_number <= session.request_number {
                        log::debug!(
                            "discarding stale re-proposal #{} from {}",
                            proposal.request_number,
                            from
                        );
                        self.registry.insert(session);
                        return;
                    }
                    log::info!("{} wants to try a different connection method", from);
                    negotiate::merge_candidates(&mut session, &proposal);
                    if !session.approved {
                        // The local user has not answered yet; remember the
                        // fresh candidates but do not start connecting.
                        self.registry.insert(session);
                        return;
                    }
                    match self.try_next(&mut session) {
                        Verdict::Keep => self.registry.insert(session),
                        Verdict::Destroy(reason) => self.finish_destroy(session, reason),
                    }
                }
            }
            return;
        }

        match proposal.status {
            RendezvousStatus::Propose => self.handle_new_proposal(from, proposal),
            _ => {
                // Possibly a late message for a session we already tore
                // down; nothing to do.
                log::debug!(
                    "control message for unknown session {} from {}",
                    proposal.cookie,
                    from
                );
            }
        }
    }

    /// Run one event-loop turn: wait up to `max_wait` for readiness, then
    /// service sockets, timers, and teardowns.
    pub fn step(&mut self, max_wait: Duration) -> io::Result<()> {
        self.reactor.poll(&mut self.events, max_wait)?;

        let fired: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        for (token, readable, writable) in fired {
            let Some(&id) = self.tokens.get(&token) else {
                continue;
            };
            self.dispatch_io(id, token, readable, writable);
        }

        for token in self.reactor.expired_timers() {
            let Some(id) = self.tokens.remove(&token) else {
                continue;
            };
            self.dispatch_timer(id, token);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    fn dispatch_io(&mut self, id: u64, token: Token, readable: bool, writable: bool) {
        let Some(mut session) = self.registry.take(id) else {
            return;
        };

        let listener_token = session.listener.as_ref().map(|(t, _)| *t);
        let verified_token = session.connect_verified.as_ref().map(|(t, _)| *t);
        let client_token = session.connect_client.as_ref().map(|(t, _)| *t);
        let stream_token = session.stream.as_ref().map(|(t, _)| *t);

        let verdict = if Some(token) == listener_token {
            self.on_listener_ready(&mut session)
        } else if Some(token) == verified_token {
            self.on_connect_event(&mut session, ConnectSlot::Verified)
        } else if Some(token) == client_token {
            self.on_connect_event(&mut session, ConnectSlot::Client)
        } else if Some(token) == stream_token {
            let mut verdict = Verdict::Keep;
            if readable {
                verdict = self.pump_read(&mut session);
            }
            if verdict == Verdict::Keep && writable {
                verdict = self.flush_outgoing(&mut session);
            }
            verdict
        } else {
            // A completion for an attempt this session already cancelled.
            Verdict::Keep
        };

        match verdict {
            Verdict::Keep => self.registry.insert(session),
            Verdict::Destroy(reason) => self.finish_destroy(session, reason),
        }
    }

    fn dispatch_timer(&mut self, id: u64, token: Token) {
        let Some(mut session) = self.registry.take(id) else {
            return;
        };

        if session.connect_timer != Some(token) {
            // The attempt this timer guarded is already over.
            self.registry.insert(session);
            return;
        }
        session.connect_timer = None;

        log::info!(
            "peer connection to {} timed out after {:?}; trying next method",
            session.peer,
            self.config.direct_timeout
        );

        match self.try_next(&mut session) {
            Verdict::Keep => self.registry.insert(session),
            Verdict::Destroy(reason) => self.finish_destroy(session, reason),
        }
    }

    // ------------------------------------------------------------------
    // Negotiation strategy execution
    // ------------------------------------------------------------------

    /// Close any remnants of the previous attempt and execute the first
    /// untried strategy, falling through strategies that cannot even
    /// start until one is in flight or all are exhausted.
    fn try_next(&mut self, session: &mut PeerSession) -> Verdict {
        self.close_attempt(session);

        loop {
            match negotiate::next_strategy(session, &self.config) {
                Strategy::Direct { verified, client } => {
                    log::info!(
                        "attempting to connect to {} at {}",
                        session.peer,
                        verified
                    );
                    let mut pending = false;

                    match self.start_connect(session.id, verified) {
                        Ok(pair) => {
                            session.connect_verified = Some(pair);
                            pending = true;
                        }
                        Err(e) => log::debug!("connect to {} failed: {}", verified, e),
                    }
                    if let Some(addr) = client {
                        match self.start_connect(session.id, addr) {
                            Ok(pair) => {
                                session.connect_client = Some(pair);
                                pending = true;
                            }
                            Err(e) => log::debug!("connect to {} failed: {}", addr, e),
                        }
                    }

                    if pending {
                        let timer = self.reactor.arm_timer(self.config.direct_timeout);
                        self.tokens.insert(timer, session.id);
                        session.connect_timer = Some(timer);
                        return Verdict::Keep;
                    }
                }
                Strategy::Incoming => match self.open_listener(session) {
                    Ok(local) => {
                        session.request_number += 1;
                        let proposal = Proposal::listening(
                            session.cookie,
                            session.capability,
                            self.config.local_ip,
                            local.port(),
                            session.request_number,
                            session.file.clone(),
                        );
                        match self.control.send(&session.peer, &proposal) {
                            Ok(()) => {
                                log::info!(
                                    "asking {} to connect to us at {}:{}",
                                    session.peer,
                                    self.config.local_ip,
                                    local.port()
                                );
                                return Verdict::Keep;
                            }
                            Err(e) => {
                                log::warn!("could not send rendezvous proposal: {}", e);
                                self.close_attempt(session);
                            }
                        }
                    }
                    Err(e) => log::debug!("could not open a listener: {}", e),
                },
                Strategy::Relay { addr } => {
                    log::info!("attempting to connect via relay server {}", addr);
                    match self.start_connect(session.id, addr) {
                        Ok(pair) => {
                            session.connect_verified = Some(pair);
                            // When the relay was our own pick (rather than
                            // one the remote proposed), the remote has to be
                            // told where to meet us.
                            if session.is_incoming {
                                session.request_number += 1;
                                let proposal = Proposal::relay(
                                    session.cookie,
                                    session.capability,
                                    addr,
                                    session.request_number,
                                    session.file.clone(),
                                );
                                if let Err(e) = self.control.send(&session.peer, &proposal) {
                                    log::warn!("could not send relay proposal: {}", e);
                                }
                            }
                            return Verdict::Keep;
                        }
                        Err(e) => log::debug!("relay connect to {} failed: {}", addr, e),
                    }
                }
                Strategy::GiveUp => {
                    return Verdict::Destroy(DisconnectReason::CouldNotConnect);
                }
            }
        }
    }

    /// Start one non-blocking outbound connect, registered for
    /// writability so completion arrives through the reactor.
    fn start_connect(&mut self, id: u64, addr: SocketAddr) -> io::Result<(Token, TcpStream)> {
        let mut stream = TcpStream::connect(addr)?;
        let token = self.reactor.token();
        self.reactor.register(&mut stream, token, Interest::WRITABLE)?;
        self.tokens.insert(token, id);
        Ok((token, stream))
    }

    /// Bind the first free port in the configured range.
    fn open_listener(&mut self, session: &mut PeerSession) -> io::Result<SocketAddr> {
        let bind_ip: IpAddr = match self.config.local_ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };

        let mut last_err =
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no port in listen range");
        for port in self.config.listen_ports.clone() {
            match TcpListener::bind(SocketAddr::new(bind_ip, port)) {
                Ok(mut listener) => {
                    let token = self.reactor.token();
                    self.reactor
                        .register(&mut listener, token, Interest::READABLE)?;
                    self.tokens.insert(token, session.id);
                    let local = listener.local_addr()?;
                    session.listener = Some((token, listener));
                    return Ok(local);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// A connect attempt became writable: it either finished or failed.
    fn on_connect_event(&mut self, session: &mut PeerSession, slot: ConnectSlot) -> Verdict {
        let taken = match slot {
            ConnectSlot::Verified => session.connect_verified.take(),
            ConnectSlot::Client => session.connect_client.take(),
        };
        let Some((token, mut stream)) = taken else {
            return Verdict::Keep;
        };

        match Self::connect_status(&stream) {
            ConnectStatus::Pending => {
                // Spurious wakeup; keep waiting on the same registration.
                let slot_ref = match slot {
                    ConnectSlot::Verified => &mut session.connect_verified,
                    ConnectSlot::Client => &mut session.connect_client,
                };
                *slot_ref = Some((token, stream));
                Verdict::Keep
            }
            ConnectStatus::Failed(e) => {
                log::debug!("connect attempt for {} failed: {}", session.peer, e);
                self.reactor.deregister(&mut stream);
                self.tokens.remove(&token);
                drop(stream);

                if session.connect_pending() {
                    // The parallel attempt is still racing; let it finish.
                    Verdict::Keep
                } else {
                    self.try_next(session)
                }
            }
            ConnectStatus::Connected => {
                // First success wins: the other attempt and the guard
                // timer are cancelled before anything else happens.
                if let Some(timer) = session.connect_timer.take() {
                    self.reactor.cancel_timer(timer);
                    self.tokens.remove(&timer);
                }
                if let Some((t, mut other)) = session.connect_verified.take() {
                    self.reactor.deregister(&mut other);
                    self.tokens.remove(&t);
                }
                if let Some((t, mut other)) = session.connect_client.take() {
                    self.reactor.deregister(&mut other);
                    self.tokens.remove(&t);
                }

                if let Err(e) = self
                    .reactor
                    .reregister(&mut stream, token, Interest::READABLE)
                {
                    log::debug!("could not watch connected socket: {}", e);
                    self.reactor.deregister(&mut stream);
                    self.tokens.remove(&token);
                    return self.try_next(session);
                }

                session.stream = Some((token, stream));
                session.touch();
                self.finalize(session)
            }
        }
    }

    fn connect_status(stream: &TcpStream) -> ConnectStatus {
        match stream.take_error() {
            Ok(Some(e)) => return ConnectStatus::Failed(e),
            Err(e) => return ConnectStatus::Failed(e),
            Ok(None) => {}
        }
        match stream.peer_addr() {
            Ok(_) => ConnectStatus::Connected,
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                ConnectStatus::Pending
            }
            Err(e) => ConnectStatus::Failed(e),
        }
    }

    /// The listener became readable: accept the peer and stop listening.
    fn on_listener_ready(&mut self, session: &mut PeerSession) -> Verdict {
        let accepted = match session.listener.as_mut() {
            Some((_, listener)) => listener.accept(),
            None => return Verdict::Keep,
        };

        match accepted {
            Ok((mut stream, addr)) => {
                log::info!("accepted peer connection from {}", addr);

                let token = self.reactor.token();
                if let Err(e) = self.reactor.register(&mut stream, token, Interest::READABLE)
                {
                    log::debug!("could not watch accepted socket: {}", e);
                    return self.try_next(session);
                }
                self.tokens.insert(token, session.id);

                if let Some((ltoken, mut listener)) = session.listener.take() {
                    self.reactor.deregister(&mut listener);
                    self.tokens.remove(&ltoken);
                }

                session.stream = Some((token, stream));
                session.touch();
                self.finalize(session)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Verdict::Keep,
            Err(e) => {
                log::debug!("accept failed: {}", e);
                self.try_next(session)
            }
        }
    }

    // ------------------------------------------------------------------
    // Post-connect handshake
    // ------------------------------------------------------------------

    /// A stream socket is up. Relay attempts run the relay setup exchange
    /// first; everything else goes straight to establishment.
    fn finalize(&mut self, session: &mut PeerSession) -> Verdict {
        if session.state() == NegotiationState::TryRelay {
            let role = if session.initiated_locally {
                RelayRole::Initiator
            } else {
                RelayRole::Receiver
            };
            log::debug!(
                "relay connected; announcing cookie {} as {:?}",
                session.cookie,
                role
            );
            session.relay_handshake = Some(RelayHandshake::new());
            session
                .outgoing
                .append(&relay::encode_setup(&session.cookie, role));
            return self.flush_outgoing(session);
        }

        self.establish(session)
    }

    /// The channel now counts as CONNECTED. The connecting side proves
    /// itself by sending the session cookie and announces success over
    /// the control channel; the accepting side stays silent until the
    /// peer's cookie frame arrives.
    fn establish(&mut self, session: &mut PeerSession) -> Verdict {
        session.state = NegotiationState::Connected;
        session.relay_handshake = None;

        if session.is_incoming {
            log::debug!(
                "connection with {} up; waiting for cookie verification",
                session.peer
            );
            return self.flush_outgoing(session);
        }

        if let Ok(bytes) = frame::encode_frame(session.capability, session.cookie.as_bytes()) {
            session.outgoing.append(&bytes);
        }
        let notice = Proposal::connected(session.cookie, session.capability);
        if let Err(e) = self.control.send(&session.peer, &notice) {
            log::debug!("could not send connected notice: {}", e);
        }

        session.ready = true;
        log::info!(
            "{} session with {} established (cookie={})",
            session.capability,
            session.peer,
            session.cookie
        );
        self.observer
            .on_ready(&session.peer, session.capability, &session.cookie);

        self.flush_outgoing(session)
    }

    // ------------------------------------------------------------------
    // Data paths
    // ------------------------------------------------------------------

    /// Drain readable bytes: relay handshake bytes while one is pending,
    /// peer frames afterwards. Loops until the socket would block.
    fn pump_read(&mut self, session: &mut PeerSession) -> Verdict {
        loop {
            if session.relay_handshake.is_some() {
                match self.pump_relay_handshake(session) {
                    Ok(Verdict::Keep) if session.relay_handshake.is_none() => continue,
                    Ok(verdict) => return verdict,
                    Err(verdict) => return verdict,
                }
            }

            let magic = session.capability.magic();
            let outcome = match session.stream.as_mut() {
                Some((_, stream)) => session.assembler.read_frame(stream, magic),
                None => return Verdict::Keep,
            };

            match outcome {
                Ok(ReadOutcome::Frame(payload)) => {
                    session.touch();

                    if !session.ready {
                        // First frame from an unverified peer must carry
                        // the session cookie.
                        if session.cookie.matches(&payload) {
                            session.ready = true;
                            log::info!(
                                "{} session with {} established (cookie={})",
                                session.capability,
                                session.peer,
                                session.cookie
                            );
                            self.observer.on_ready(
                                &session.peer,
                                session.capability,
                                &session.cookie,
                            );
                            continue;
                        }
                        log::warn!(
                            "peer claiming to be {} failed cookie verification",
                            session.peer
                        );
                        return Verdict::Destroy(DisconnectReason::InvalidData);
                    }

                    self.observer.on_frame(
                        &session.peer,
                        session.capability,
                        &session.cookie,
                        &payload,
                    );
                }
                Ok(ReadOutcome::NeedMore) => return Verdict::Keep,
                Ok(ReadOutcome::Closed) => {
                    return Verdict::Destroy(DisconnectReason::RemoteClosed)
                }
                Ok(ReadOutcome::BadMagic) => {
                    return Verdict::Destroy(DisconnectReason::InvalidData)
                }
                Err(e) => {
                    log::info!("read from {} failed: {}", session.peer, e);
                    return Verdict::Destroy(DisconnectReason::LostConnection);
                }
            }
        }
    }

    /// Feed relay bytes until READY. Relay failures are transport
    /// failures: they fall through to the remaining strategies (none, at
    /// this point) rather than surfacing their own reason.
    ///
    /// `Ok(Keep)` with the handshake cleared means READY arrived and the
    /// session was established; the caller resumes frame reading.
    fn pump_relay_handshake(
        &mut self,
        session: &mut PeerSession,
    ) -> Result<Verdict, Verdict> {
        // Peek first and consume exactly one relay message, so bytes that
        // arrive right behind READY already belong to the frame stream.
        let attempt = {
            let Some((_, stream)) = session.stream.as_mut() else {
                return Ok(Verdict::Keep);
            };
            let mut peeked = [0u8; 64];
            match stream.peek(&mut peeked) {
                Ok(0) => HandshakeIo::Closed,
                Ok(n) => match relay::message_len(&peeked[..n]) {
                    Some(total) if total <= n => {
                        let mut message = vec![0u8; total];
                        match stream.read(&mut message) {
                            Ok(read) if read == total => HandshakeIo::Message(message),
                            Ok(_) => HandshakeIo::Closed,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                HandshakeIo::Wait
                            }
                            Err(e) => HandshakeIo::Error(e),
                        }
                    }
                    Some(total) if total > peeked.len() => HandshakeIo::Garbage,
                    _ => HandshakeIo::Wait,
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => HandshakeIo::Wait,
                Err(e) => HandshakeIo::Error(e),
            }
        };

        match attempt {
            HandshakeIo::Wait => Ok(Verdict::Keep),
            HandshakeIo::Closed => {
                log::debug!("relay closed the connection during setup");
                Err(self.try_next(session))
            }
            HandshakeIo::Garbage => {
                log::warn!("relay setup failed for {}", session.cookie);
                Err(self.try_next(session))
            }
            HandshakeIo::Error(e) => {
                log::debug!("relay read failed: {}", e);
                Err(self.try_next(session))
            }
            HandshakeIo::Message(message) => {
                session.touch();
                let progress = match session.relay_handshake.as_mut() {
                    Some(handshake) => handshake.on_bytes(&message),
                    None => return Ok(Verdict::Keep),
                };
                match progress {
                    RelayProgress::Pending => Ok(Verdict::Keep),
                    RelayProgress::Ready => {
                        session.relay_handshake = None;
                        Ok(self.establish(session))
                    }
                    RelayProgress::Failed => {
                        log::warn!("relay setup failed for {}", session.cookie);
                        Err(self.try_next(session))
                    }
                }
            }
        }
    }

    /// Write as much of the outgoing queue as the socket accepts, arming
    /// and disarming write interest so the reactor only wakes us while
    /// bytes are actually waiting.
    fn flush_outgoing(&mut self, session: &mut PeerSession) -> Verdict {
        let (token, result) = match session.stream.as_mut() {
            Some((token, stream)) => (*token, session.outgoing.drain(stream)),
            None => return Verdict::Keep,
        };

        match result {
            Ok(written) => {
                if written > 0 {
                    session.touch();
                }
                let want_write = !session.outgoing.is_empty();
                if want_write != session.write_armed {
                    let interests = if want_write {
                        Interest::READABLE | Interest::WRITABLE
                    } else {
                        Interest::READABLE
                    };
                    if let Some((_, stream)) = session.stream.as_mut() {
                        if let Err(e) = self.reactor.reregister(stream, token, interests) {
                            log::debug!("could not adjust write interest: {}", e);
                            return Verdict::Destroy(DisconnectReason::LostConnection);
                        }
                    }
                    session.write_armed = want_write;
                }
                Verdict::Keep
            }
            Err(e) => {
                if session.ready {
                    log::info!("write to {} failed: {}", session.peer, e);
                    Verdict::Destroy(DisconnectReason::LostConnection)
                } else {
                    // A setup frame that could not be written, e.g. to a
                    // relay that went away mid-negotiation.
                    log::debug!("write failed during negotiation: {}", e);
                    self.try_next(session)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound proposals
    // ------------------------------------------------------------------

    fn handle_new_proposal(&mut self, from: &str, proposal: Proposal) {
        match proposal.capability {
            Capability::DirectMessage => {
                // A brand-new request supersedes whatever session we had
                // with this peer.
                if let Some(old) = self
                    .registry
                    .find_by_peer(from, Capability::DirectMessage)
                    .map(|s| s.id)
                {
                    log::info!(
                        "new direct-message proposal from {}; destroying old session",
                        from
                    );
                    self.destroy_by_id(old, DisconnectReason::RemoteClosed);
                }
            }
            Capability::FileTransfer => {
                let busy = self
                    .registry
                    .find_by_peer(from, Capability::FileTransfer)
                    .map(|s| s.ready)
                    .unwrap_or(false);
                if busy {
                    log::info!(
                        "refusing file-transfer proposal from {}: a transfer is active",
                        from
                    );
                    let cancel = Proposal::cancel(proposal.cookie, proposal.capability);
                    if let Err(e) = self.control.send(from, &cancel) {
                        log::debug!("could not send refusal: {}", e);
                    }
                    return;
                }
            }
        }

        let id = self.registry.next_id();
        let mut session = PeerSession::new(id, proposal.capability, from, proposal.cookie);
        negotiate::merge_candidates(&mut session, &proposal);
        session.file = proposal.file.clone();

        log::info!(
            "{} proposes a {} session (cookie={})",
            from,
            proposal.capability,
            proposal.cookie
        );

        self.registry.insert(session);
        self.observer.on_proposal(from, &proposal);
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Release every resource an attempt may have acquired. Idempotent:
    /// already-closed sockets and already-cancelled timers are no-ops.
    fn close_attempt(&mut self, session: &mut PeerSession) {
        if let Some((token, mut listener)) = session.listener.take() {
            self.reactor.deregister(&mut listener);
            self.tokens.remove(&token);
        }
        if let Some((token, mut stream)) = session.stream.take() {
            self.reactor.deregister(&mut stream);
            self.tokens.remove(&token);
        }
        if let Some((token, mut stream)) = session.connect_verified.take() {
            self.reactor.deregister(&mut stream);
            self.tokens.remove(&token);
        }
        if let Some((token, mut stream)) = session.connect_client.take() {
            self.reactor.deregister(&mut stream);
            self.tokens.remove(&token);
        }
        if let Some(timer) = session.connect_timer.take() {
            self.reactor.cancel_timer(timer);
            self.tokens.remove(&timer);
        }
        session.relay_handshake = None;
        session.assembler.reset();
        session.outgoing.clear();
        session.write_armed = false;
        session.is_incoming = false;
    }

    fn destroy_by_id(&mut self, id: u64, reason: DisconnectReason) -> bool {
        match self.registry.take(id) {
            Some(session) => {
                self.finish_destroy(session, reason);
                true
            }
            None => false,
        }
    }

    /// Final teardown of a session already detached from the registry.
    fn finish_destroy(&mut self, mut session: PeerSession, reason: DisconnectReason) {
        log::info!(
            "destroying {} session with {} ({})",
            session.capability,
            session.peer,
            reason
        );

        self.close_attempt(&mut session);
        session.state = NegotiationState::Failed;

        // If we abandon a rendezvous the remote side may still be waiting
        // on; tell it to stop.
        if reason == DisconnectReason::LocalClosed && !session.ready {
            let cancel = Proposal::cancel(session.cookie, session.capability);
            if let Err(e) = self.control.send(&session.peer, &cancel) {
                log::debug!("could not send cancel: {}", e);
            }
        }

        self.observer.on_disconnected(
            &session.peer,
            session.capability,
            &session.cookie,
            reason,
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::Ipv4Addr;
    use std::rc::Rc;

    #[derive(Default)]
    struct Recorded {
        sent: Vec<(String, Proposal)>,
        proposals: Vec<(String, Proposal)>,
        ready: Vec<Cookie>,
        frames: Vec<Vec<u8>>,
        disconnects: Vec<(Cookie, DisconnectReason)>,
    }

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Recorded>>);

    impl ControlChannel for Recorder {
        fn send(&mut self, to: &str, proposal: &Proposal) -> io::Result<()> {
            self.0.borrow_mut().sent.push((to.to_string(), proposal.clone()));
            Ok(())
        }
    }

    impl RendezvousObserver for Recorder {
        fn on_proposal(&mut self, from: &str, proposal: &Proposal) {
            self.0
                .borrow_mut()
                .proposals
                .push((from.to_string(), proposal.clone()));
        }
        fn on_ready(&mut self, _peer: &str, _capability: Capability, cookie: &Cookie) {
            self.0.borrow_mut().ready.push(*cookie);
        }
        fn on_frame(
            &mut self,
            _peer: &str,
            _capability: Capability,
            _cookie: &Cookie,
            payload: &[u8],
        ) {
            self.0.borrow_mut().frames.push(payload.to_vec());
        }
        fn on_disconnected(
            &mut self,
            _peer: &str,
            _capability: Capability,
            cookie: &Cookie,
            reason: DisconnectReason,
        ) {
            self.0.borrow_mut().disconnects.push((*cookie, reason));
        }
    }

    fn test_engine() -> (RendezvousEngine, Recorder) {
        let recorder = Recorder::default();
        let config = Config {
            // Ephemeral range unlikely to collide with other tests.
            listen_ports: 35190..=35290,
            direct_timeout: Duration::from_millis(200),
            ..Config::default()
        };
        let engine = RendezvousEngine::new(
            config,
            Box::new(recorder.clone()),
            Box::new(recorder.clone()),
        )
        .unwrap();
        (engine, recorder)
    }

    fn inbound_proposal(cookie: Cookie, port: u16) -> Proposal {
        Proposal {
            cookie,
            capability: Capability::DirectMessage,
            status: RendezvousStatus::Propose,
            verified_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            client_ip: None,
            port,
            relay_ip: None,
            relay_port: None,
            use_relay: false,
            request_number: 1,
            file: None,
        }
    }

    #[test]
    fn test_local_propose_opens_listener_and_sends_proposal() {
        let (mut engine, recorder) = test_engine();

        // No candidate addresses are known yet, so the first strategy
        // that can start is TRY_INCOMING.
        let cookie = engine
            .propose(Capability::DirectMessage, "buddy", None)
            .unwrap();
        assert_eq!(
            engine.session_state(&cookie),
            Some(NegotiationState::TryIncoming)
        );

        let recorded = recorder.0.borrow();
        assert_eq!(recorded.sent.len(), 1);
        let (to, proposal) = &recorded.sent[0];
        assert_eq!(to, "buddy");
        assert_eq!(proposal.status, RendezvousStatus::Propose);
        assert_eq!(proposal.cookie, cookie);
        assert_eq!(proposal.request_number, 1);
        assert!(engine.config().listen_ports.contains(&proposal.port));
    }

    #[test]
    fn test_propose_file_transfer_requires_metadata() {
        let (mut engine, _) = test_engine();
        assert!(engine
            .propose(Capability::FileTransfer, "buddy", None)
            .is_err());
        assert_eq!(engine.session_count(), 0);
    }

    #[test]
    fn test_inbound_proposal_waits_for_approval() {
        let (mut engine, recorder) = test_engine();
        let cookie = Cookie::from_bytes(*b"INBOUND1");

        engine.handle_control_message("buddy", inbound_proposal(cookie, 5190));

        assert_eq!(engine.session_count(), 1);
        assert_eq!(engine.session_state(&cookie), Some(NegotiationState::New));
        assert_eq!(recorder.0.borrow().proposals.len(), 1);

        // Accepting kicks off the fallback sequence.
        assert!(engine.accept_proposal(&cookie));
        assert_ne!(engine.session_state(&cookie), Some(NegotiationState::New));
    }

    #[test]
    fn test_reject_proposal_sends_cancel() {
        let (mut engine, recorder) = test_engine();
        let cookie = Cookie::from_bytes(*b"INBOUND2");

        engine.handle_control_message("buddy", inbound_proposal(cookie, 5190));
        assert!(engine.reject_proposal(&cookie));

        let recorded = recorder.0.borrow();
        assert_eq!(recorded.sent.len(), 1);
        assert_eq!(recorded.sent[0].1.status, RendezvousStatus::Cancel);
        assert_eq!(
            recorded.disconnects,
            vec![(cookie, DisconnectReason::LocalClosed)]
        );
        assert_eq!(engine.session_count(), 0);
    }

    #[test]
    fn test_malformed_file_transfer_proposal_creates_no_session() {
        let (mut engine, recorder) = test_engine();
        let mut proposal = inbound_proposal(Cookie::from_bytes(*b"BADFILE1"), 5190);
        proposal.capability = Capability::FileTransfer;
        proposal.file = None;

        engine.handle_control_message("buddy", proposal);

        assert_eq!(engine.session_count(), 0);
        assert!(recorder.0.borrow().proposals.is_empty());
    }

    #[test]
    fn test_remote_cancel_destroys_session_mid_negotiation() {
        // Scenario: the remote party cancels while a TRY_DIRECT attempt
        // is in flight for the matching cookie.
        let (mut engine, recorder) = test_engine();
        let cookie = Cookie::from_bytes(*b"CANCELME");

        // A blackhole address keeps the connect pending.
        let mut proposal = inbound_proposal(cookie, 9);
        proposal.verified_ip = Some(IpAddr::V4(Ipv4Addr::new(10, 255, 255, 1)));
        engine.handle_control_message("buddy", proposal);
        assert!(engine.accept_proposal(&cookie));

        let cancel = Proposal::cancel(cookie, Capability::DirectMessage);
        engine.handle_control_message("buddy", cancel);

        assert_eq!(engine.session_count(), 0);
        assert_eq!(
            recorder.0.borrow().disconnects,
            vec![(cookie, DisconnectReason::RemoteRefused)]
        );
    }

    #[test]
    fn test_cancel_from_wrong_identity_not_attributed() {
        let (mut engine, recorder) = test_engine();
        let cookie = Cookie::from_bytes(*b"SPOOFED1");

        engine.handle_control_message("buddy", inbound_proposal(cookie, 5190));

        // Same cookie, different sender: must not touch the session.
        let cancel = Proposal::cancel(cookie, Capability::DirectMessage);
        engine.handle_control_message("mallory", cancel);

        assert_eq!(engine.session_count(), 1);
        assert!(recorder.0.borrow().disconnects.is_empty());
    }

    #[test]
    fn test_stale_reproposal_discarded() {
        let (mut engine, _) = test_engine();
        let cookie = Cookie::from_bytes(*b"STALEONE");

        engine.handle_control_message("buddy", inbound_proposal(cookie, 5190));
        assert_eq!(engine.session_state(&cookie), Some(NegotiationState::New));

        // Re-proposal with the same request number must be ignored, not
        // restart negotiation.
        engine.handle_control_message("buddy", inbound_proposal(cookie, 5190));
        assert_eq!(engine.session_state(&cookie), Some(NegotiationState::New));
        assert_eq!(engine.session_count(), 1);
    }

    #[test]
    fn test_relay_proposal_while_listening_closes_listener() {
        // Scenario: while waiting for an inbound connection, a relay
        // proposal arrives; the listener is abandoned immediately in
        // favour of TRY_PROXY.
        let (mut engine, _) = test_engine();

        let cookie = engine
            .propose(Capability::DirectMessage, "buddy", None)
            .unwrap();
        assert_eq!(
            engine.session_state(&cookie),
            Some(NegotiationState::TryIncoming)
        );

        let mut relay = inbound_proposal(cookie, 0);
        relay.verified_ip = None;
        relay.use_relay = true;
        relay.relay_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        relay.relay_port = Some(1); // nothing listens there
        relay.request_number = 2;
        engine.handle_control_message("buddy", relay);

        assert_eq!(
            engine.session_state(&cookie),
            Some(NegotiationState::TryRelay)
        );
    }

    #[test]
    fn test_relay_connect_failure_exhausts_strategies() {
        let (mut engine, recorder) = test_engine();

        let cookie = engine
            .propose(Capability::DirectMessage, "buddy", None)
            .unwrap();

        let mut relay = inbound_proposal(cookie, 0);
        relay.verified_ip = None;
        relay.use_relay = true;
        relay.relay_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        relay.relay_port = Some(1);
        relay.request_number = 2;
        engine.handle_control_message("buddy", relay);

        // The refused relay connect is the last strategy; the session
        // must end with "could not connect".
        for _ in 0..100 {
            engine.step(Duration::from_millis(10)).unwrap();
            if engine.session_count() == 0 {
                break;
            }
        }
        assert_eq!(
            recorder.0.borrow().disconnects,
            vec![(cookie, DisconnectReason::CouldNotConnect)]
        );
    }

    #[test]
    fn test_direct_timeout_falls_back_to_incoming() {
        // Scenario: the direct connect makes no progress; the guard timer
        // fires and the engine opens a listener instead.
        let (mut engine, recorder) = test_engine();
        let cookie = Cookie::from_bytes(*b"TIMEOUT1");

        let mut proposal = inbound_proposal(cookie, 9);
        proposal.verified_ip = Some(IpAddr::V4(Ipv4Addr::new(10, 255, 255, 1)));
        engine.handle_control_message("buddy", proposal);
        assert!(engine.accept_proposal(&cookie));

        for _ in 0..100 {
            engine.step(Duration::from_millis(10)).unwrap();
            if engine.session_state(&cookie) == Some(NegotiationState::TryIncoming) {
                break;
            }
        }
        assert_eq!(
            engine.session_state(&cookie),
            Some(NegotiationState::TryIncoming)
        );

        // Falling back to listening sends a fresh "connect to me" proposal.
        let recorded = recorder.0.borrow();
        assert!(recorded
            .sent
            .iter()
            .any(|(_, p)| p.status == RendezvousStatus::Propose && p.port != 0));
    }

    #[test]
    fn test_first_direct_connect_wins_race_and_cancels_sibling() {
        // Scenario: both candidate addresses are tried in parallel. The
        // verified address answers, the client address is a blackhole;
        // the completed connect must cancel the other attempt and the
        // guard timer, and the session goes CONNECTED without ever
        // falling back to listening.
        let (mut engine, recorder) = test_engine();
        let cookie = Cookie::from_bytes(*b"RACEWIN1");

        let listener =
            std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut proposal = inbound_proposal(cookie, port);
        proposal.client_ip = Some(IpAddr::V4(Ipv4Addr::new(10, 255, 255, 1)));
        engine.handle_control_message("buddy", proposal);
        assert!(engine.accept_proposal(&cookie));
        assert_eq!(
            engine.session_state(&cookie),
            Some(NegotiationState::TryDirect)
        );

        for _ in 0..100 {
            engine.step(Duration::from_millis(10)).unwrap();
            if engine.is_ready(&cookie) {
                break;
            }
        }
        assert_eq!(
            engine.session_state(&cookie),
            Some(NegotiationState::Connected)
        );
        assert!(engine.is_ready(&cookie));
        assert_eq!(recorder.0.borrow().ready, vec![cookie]);

        // The losing attempt and the timeout are gone.
        let session = engine.registry.find_by_cookie(&cookie).unwrap();
        assert!(session.connect_verified.is_none());
        assert!(session.connect_client.is_none());
        assert!(session.connect_timer.is_none());

        // Winning outright means no "connect to me" fallback proposal.
        let recorded = recorder.0.borrow();
        assert!(recorded
            .sent
            .iter()
            .all(|(_, p)| p.status != RendezvousStatus::Propose));
        drop(listener);
    }

    #[test]
    fn test_new_direct_message_proposal_replaces_old_session() {
        let (mut engine, recorder) = test_engine();

        let old = Cookie::from_bytes(*b"OLDOLD11");
        engine.handle_control_message("buddy", inbound_proposal(old, 5190));
        assert_eq!(engine.session_count(), 1);

        let new = Cookie::from_bytes(*b"NEWNEW22");
        engine.handle_control_message("buddy", inbound_proposal(new, 5191));

        assert_eq!(engine.session_count(), 1);
        assert!(engine.session_state(&new).is_some());
        assert!(engine.session_state(&old).is_none());
        assert_eq!(
            recorder.0.borrow().disconnects,
            vec![(old, DisconnectReason::RemoteClosed)]
        );
    }

    #[test]
    fn test_local_dm_propose_reuses_ready_session() {
        let (mut engine, _) = test_engine();

        // Fake an established session by marking it ready directly.
        let cookie = engine
            .propose(Capability::DirectMessage, "buddy", None)
            .unwrap();
        let id = engine.registry.find_by_cookie(&cookie).unwrap().id;
        engine.registry.get_mut(id).unwrap().ready = true;

        let again = engine
            .propose(Capability::DirectMessage, "buddy", None)
            .unwrap();
        assert_eq!(again, cookie);
        assert_eq!(engine.session_count(), 1);
    }

    #[test]
    fn test_send_frame_refused_before_ready() {
        let (mut engine, _) = test_engine();
        let cookie = engine
            .propose(Capability::DirectMessage, "buddy", None)
            .unwrap();

        assert_eq!(
            engine.send_frame(&cookie, b"too early"),
            Err(SendError::NotReady)
        );

        let unknown = Cookie::from_bytes(*b"NOEXIST1");
        assert_eq!(
            engine.send_frame(&unknown, b"nobody home"),
            Err(SendError::UnknownSession)
        );
    }

    #[test]
    fn test_close_cancels_pending_rendezvous() {
        let (mut engine, recorder) = test_engine();
        let cookie = engine
            .propose(Capability::DirectMessage, "buddy", None)
            .unwrap();

        assert!(engine.close(&cookie));
        assert_eq!(engine.session_count(), 0);

        let recorded = recorder.0.borrow();
        // First message proposed the rendezvous, second cancels it.
        assert_eq!(recorded.sent.len(), 2);
        assert_eq!(recorded.sent[1].1.status, RendezvousStatus::Cancel);
        assert_eq!(
            recorded.disconnects,
            vec![(cookie, DisconnectReason::LocalClosed)]
        );
    }
}
