//! Peer-to-peer rendezvous connection engine.
//!
//! Establishes direct TCP connections between two instant-messaging
//! clients for latency-sensitive messaging ("ODC2" frames) and bulk file
//! transfer ("OFT2" frames), negotiating over an already-authenticated
//! server channel and falling back through three strategies until one
//! yields a socket:
//!
//! 1. Connect straight to the remote user's candidate addresses.
//! 2. Open a listener and invite the remote user to connect to us.
//! 3. Meet at an intermediate relay server.
//!
//! Every session is correlated end to end by a random 8-byte cookie, and
//! whichever side accepts a connection demands that cookie from the first
//! frame before any payload flows.
//!
//! The engine is single-threaded and non-blocking: the application owns
//! the thread, feeds inbound control messages to
//! [`RendezvousEngine::handle_control_message`], and drives all socket
//! progress by calling [`RendezvousEngine::step`] in its main loop.
//! Integration happens at two seams: [`ControlChannel`] for outbound
//! rendezvous messages and [`RendezvousObserver`] for status callbacks.
//!
//! ```no_run
//! use peer_rendezvous::{Capability, Config, RendezvousEngine};
//! # use peer_rendezvous::{ControlChannel, Proposal, RendezvousObserver};
//! # use peer_rendezvous::{Cookie, DisconnectReason};
//! # struct Channel;
//! # impl ControlChannel for Channel {
//! #     fn send(&mut self, _: &str, _: &Proposal) -> std::io::Result<()> { Ok(()) }
//! # }
//! # struct App;
//! # impl RendezvousObserver for App {
//! #     fn on_proposal(&mut self, _: &str, _: &Proposal) {}
//! #     fn on_ready(&mut self, _: &str, _: Capability, _: &Cookie) {}
//! #     fn on_frame(&mut self, _: &str, _: Capability, _: &Cookie, _: &[u8]) {}
//! #     fn on_disconnected(&mut self, _: &str, _: Capability, _: &Cookie, _: DisconnectReason) {}
//! # }
//!
//! let mut engine = RendezvousEngine::new(
//!     Config::default(),
//!     Box::new(Channel),
//!     Box::new(App),
//! )?;
//!
//! let cookie = engine.propose(Capability::DirectMessage, "buddy", None)?;
//! loop {
//!     engine.step(std::time::Duration::from_millis(50))?;
//!     # break;
//! }
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod config;
pub mod cookie;
pub mod engine;
pub mod error;
pub mod frame;
pub mod negotiate;
pub mod proposal;
pub mod reactor;
pub mod registry;
pub mod relay;
pub mod session;

pub use config::Config;
pub use cookie::{Cookie, COOKIE_LEN};
pub use engine::{RendezvousEngine, RendezvousObserver};
pub use error::{DisconnectReason, FrameError, ProposalError, SendError};
pub use negotiate::NegotiationState;
pub use proposal::{ControlChannel, Proposal, RendezvousStatus};
pub use session::{Capability, FileInfo};
