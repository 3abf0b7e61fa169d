//! Peer overlay: framed transport, authenticated handshake, message
//! dispatch, and flood control.

pub mod floodgate;
pub mod frame;
pub mod manager;
pub mod message;
pub mod peer;
pub mod peer_record;
pub mod xdr;

pub use manager::{OverlayGateway, OverlayManager, PeerSender};
pub use message::{MessageType, StellarMessage};
pub use peer::{NodeInfo, Peer, PeerRole, PeerState};
