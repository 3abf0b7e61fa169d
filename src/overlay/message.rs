//! Overlay wire messages.
//!
//! `StellarMessage` is an XDR union discriminated by [`MessageType`].
//! Consensus payloads (transaction envelopes, SCP envelopes, quorum sets)
//! are carried as opaque XDR blobs: the herder owns their interpretation,
//! the overlay only frames, hashes, and routes them.

use crate::crypto::{sha256, Hash, PublicKey};
use crate::overlay::xdr::{XdrError, XdrReader, XdrWriter};

/// Wire discriminant of the message union. Values are part of the protocol
/// and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    ErrorMsg = 0,
    Hello = 1,
    Auth = 2,
    DontHave = 3,
    GetPeers = 4,
    Peers = 5,
    GetTxSet = 6,
    TxSet = 7,
    Transaction = 8,
    GetScpQuorumSet = 9,
    ScpQuorumSet = 10,
    ScpMessage = 11,
}

impl MessageType {
    pub fn from_u32(v: u32) -> Option<Self> {
        use MessageType::*;
        Some(match v {
            0 => ErrorMsg,
            1 => Hello,
            2 => Auth,
            3 => DontHave,
            4 => GetPeers,
            5 => Peers,
            6 => GetTxSet,
            7 => TxSet,
            8 => Transaction,
            9 => GetScpQuorumSet,
            10 => ScpQuorumSet,
            11 => ScpMessage,
            _ => return None,
        })
    }

    /// Stable label for metrics and log lines.
    pub fn name(&self) -> &'static str {
        use MessageType::*;
        match self {
            ErrorMsg => "error",
            Hello => "hello",
            Auth => "auth",
            DontHave => "dont-have",
            GetPeers => "get-peers",
            Peers => "peers",
            GetTxSet => "get-txset",
            TxSet => "txset",
            Transaction => "transaction",
            GetScpQuorumSet => "get-scp-qset",
            ScpQuorumSet => "scp-qset",
            ScpMessage => "scp-message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMsg {
    pub code: u32,
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub ledger_version: u32,
    pub overlay_version: u32,
    pub version_str: String,
    pub network_id: Hash,
    pub listening_port: i32,
    pub peer_id: PublicKey,
    pub nonce: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub signature: [u8; 64],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DontHave {
    pub message_type: MessageType,
    pub req_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub ip: [u8; 4],
    pub port: u32,
    pub num_failures: u32,
}

/// Opaque transaction envelope, interpreted by the herder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEnvelope(pub Vec<u8>);

impl TransactionEnvelope {
    pub fn contents_hash(&self) -> Hash {
        sha256(&self.0)
    }
}

/// Opaque SCP envelope, interpreted by the herder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpEnvelope(pub Vec<u8>);

/// Opaque SCP quorum set, interpreted by the herder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpQuorumSet(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSet {
    pub previous_ledger_hash: Hash,
    pub txs: Vec<TransactionEnvelope>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StellarMessage {
    Error(ErrorMsg),
    Hello(Hello),
    Auth(Auth),
    DontHave(DontHave),
    GetPeers,
    Peers(Vec<PeerAddress>),
    GetTxSet(Hash),
    TxSet(TxSet),
    Transaction(TransactionEnvelope),
    GetScpQuorumSet(Hash),
    ScpQuorumSet(ScpQuorumSet),
    ScpMessage(ScpEnvelope),
}

impl StellarMessage {
    pub fn message_type(&self) -> MessageType {
        use StellarMessage::*;
        match self {
            Error(_) => MessageType::ErrorMsg,
            Hello(_) => MessageType::Hello,
            Auth(_) => MessageType::Auth,
            DontHave(_) => MessageType::DontHave,
            GetPeers => MessageType::GetPeers,
            Peers(_) => MessageType::Peers,
            GetTxSet(_) => MessageType::GetTxSet,
            TxSet(_) => MessageType::TxSet,
            Transaction(_) => MessageType::Transaction,
            GetScpQuorumSet(_) => MessageType::GetScpQuorumSet,
            ScpQuorumSet(_) => MessageType::ScpQuorumSet,
            ScpMessage(_) => MessageType::ScpMessage,
        }
    }

    pub fn to_xdr(&self) -> Vec<u8> {
        let mut w = XdrWriter::new();
        w.write_u32(self.message_type() as u32);
        match self {
            StellarMessage::Error(e) => {
                w.write_u32(e.code);
                w.write_string(&e.msg);
            }
            StellarMessage::Hello(h) => {
                w.write_u32(h.ledger_version);
                w.write_u32(h.overlay_version);
                w.write_string(&h.version_str);
                w.write_opaque_fixed(&h.network_id);
                w.write_i32(h.listening_port);
                w.write_opaque_fixed(h.peer_id.as_bytes());
                w.write_opaque_fixed(&h.nonce);
            }
            StellarMessage::Auth(a) => {
                w.write_opaque_fixed(&a.signature);
            }
            StellarMessage::DontHave(d) => {
                w.write_u32(d.message_type as u32);
                w.write_opaque_fixed(&d.req_hash);
            }
            StellarMessage::GetPeers => {}
            StellarMessage::Peers(peers) => {
                w.write_u32(peers.len() as u32);
                for p in peers {
                    w.write_opaque_fixed(&p.ip);
                    w.write_u32(p.port);
                    w.write_u32(p.num_failures);
                }
            }
            StellarMessage::GetTxSet(h) | StellarMessage::GetScpQuorumSet(h) => {
                w.write_opaque_fixed(h);
            }
            StellarMessage::TxSet(t) => {
                w.write_opaque_fixed(&t.previous_ledger_hash);
                w.write_u32(t.txs.len() as u32);
                for tx in &t.txs {
                    w.write_opaque_var(&tx.0);
                }
            }
            StellarMessage::Transaction(tx) => {
                w.write_opaque_var(&tx.0);
            }
            StellarMessage::ScpQuorumSet(q) => {
                w.write_opaque_var(&q.0);
            }
            StellarMessage::ScpMessage(e) => {
                w.write_opaque_var(&e.0);
            }
        }
        w.into_bytes()
    }

    pub fn from_xdr(bytes: &[u8]) -> Result<Self, XdrError> {
        let mut r = XdrReader::new(bytes);
        let tag = r.read_u32()?;
        let msg_type =
            MessageType::from_u32(tag).ok_or(XdrError::UnknownDiscriminant(tag))?;
        let msg = match msg_type {
            MessageType::ErrorMsg => StellarMessage::Error(ErrorMsg {
                code: r.read_u32()?,
                msg: r.read_string()?,
            }),
            MessageType::Hello => StellarMessage::Hello(Hello {
                ledger_version: r.read_u32()?,
                overlay_version: r.read_u32()?,
                version_str: r.read_string()?,
                network_id: r.read_opaque_fixed::<32>()?,
                listening_port: r.read_i32()?,
                peer_id: PublicKey(r.read_opaque_fixed::<32>()?),
                nonce: r.read_opaque_fixed::<32>()?,
            }),
            MessageType::Auth => StellarMessage::Auth(Auth {
                signature: r.read_opaque_fixed::<64>()?,
            }),
            MessageType::DontHave => {
                let inner = r.read_u32()?;
                StellarMessage::DontHave(DontHave {
                    message_type: MessageType::from_u32(inner)
                        .ok_or(XdrError::UnknownDiscriminant(inner))?,
                    req_hash: r.read_opaque_fixed::<32>()?,
                })
            }
            MessageType::GetPeers => StellarMessage::GetPeers,
            MessageType::Peers => {
                let count = r.read_u32()?;
                // each entry is 12 bytes on the wire
                if count as usize > r.remaining() / 12 {
                    return Err(XdrError::LengthOutOfBounds(count));
                }
                let mut peers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    peers.push(PeerAddress {
                        ip: r.read_opaque_fixed::<4>()?,
                        port: r.read_u32()?,
                        num_failures: r.read_u32()?,
                    });
                }
                StellarMessage::Peers(peers)
            }
            MessageType::GetTxSet => StellarMessage::GetTxSet(r.read_opaque_fixed::<32>()?),
            MessageType::TxSet => {
                let previous_ledger_hash = r.read_opaque_fixed::<32>()?;
                let count = r.read_u32()?;
                // a transaction envelope is at least its own length word
                if count as usize > r.remaining() / 4 {
                    return Err(XdrError::LengthOutOfBounds(count));
                }
                let mut txs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    txs.push(TransactionEnvelope(r.read_opaque_var()?));
                }
                StellarMessage::TxSet(TxSet {
                    previous_ledger_hash,
                    txs,
                })
            }
            MessageType::Transaction => {
                StellarMessage::Transaction(TransactionEnvelope(r.read_opaque_var()?))
            }
            MessageType::GetScpQuorumSet => {
                StellarMessage::GetScpQuorumSet(r.read_opaque_fixed::<32>()?)
            }
            MessageType::ScpQuorumSet => {
                StellarMessage::ScpQuorumSet(ScpQuorumSet(r.read_opaque_var()?))
            }
            MessageType::ScpMessage => StellarMessage::ScpMessage(ScpEnvelope(r.read_opaque_var()?)),
        };
        r.finish()?;
        Ok(msg)
    }

    /// Flood-memoization index: the content hash of the marshalled message.
    pub fn flood_index(&self) -> Hash {
        sha256(&self.to_xdr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: StellarMessage) {
        let bytes = msg.to_xdr();
        assert_eq!(StellarMessage::from_xdr(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_hello_round_trip() {
        round_trip(StellarMessage::Hello(Hello {
            ledger_version: 4,
            overlay_version: 2,
            version_str: "lumen-node 0.1.0".into(),
            network_id: [7u8; 32],
            listening_port: 11625,
            peer_id: PublicKey([9u8; 32]),
            nonce: [3u8; 32],
        }));
    }

    #[test]
    fn test_auth_round_trip() {
        round_trip(StellarMessage::Auth(Auth {
            signature: [0xabu8; 64],
        }));
    }

    #[test]
    fn test_void_and_payload_messages_round_trip() {
        round_trip(StellarMessage::GetPeers);
        round_trip(StellarMessage::GetTxSet([1u8; 32]));
        round_trip(StellarMessage::Transaction(TransactionEnvelope(vec![
            1, 2, 3,
        ])));
        round_trip(StellarMessage::Peers(vec![
            PeerAddress {
                ip: [10, 0, 0, 1],
                port: 11625,
                num_failures: 2,
            },
            PeerAddress {
                ip: [1, 2, 3, 4],
                port: 11625,
                num_failures: 0,
            },
        ]));
        round_trip(StellarMessage::TxSet(TxSet {
            previous_ledger_hash: [4u8; 32],
            txs: vec![TransactionEnvelope(vec![5; 7]), TransactionEnvelope(vec![])],
        }));
        round_trip(StellarMessage::DontHave(DontHave {
            message_type: MessageType::TxSet,
            req_hash: [2u8; 32],
        }));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut bytes = StellarMessage::GetPeers.to_xdr();
        bytes[3] = 0xfe;
        assert!(matches!(
            StellarMessage::from_xdr(&bytes),
            Err(XdrError::UnknownDiscriminant(0xfe))
        ));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut bytes = StellarMessage::GetPeers.to_xdr();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(
            StellarMessage::from_xdr(&bytes),
            Err(XdrError::TrailingBytes)
        );
    }

    #[test]
    fn test_absurd_peer_count_rejected() {
        let mut w = XdrWriter::new();
        w.write_u32(MessageType::Peers as u32);
        w.write_u32(u32::MAX);
        assert!(matches!(
            StellarMessage::from_xdr(&w.into_bytes()),
            Err(XdrError::LengthOutOfBounds(_))
        ));
    }

    #[test]
    fn test_flood_index_is_content_addressed() {
        let a = StellarMessage::Transaction(TransactionEnvelope(vec![1]));
        let b = StellarMessage::Transaction(TransactionEnvelope(vec![2]));
        assert_ne!(a.flood_index(), b.flood_index());
        assert_eq!(a.flood_index(), a.clone().flood_index());
    }
}
