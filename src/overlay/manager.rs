//! Overlay manager: the peer set, the floodgate, and connection policy.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crypto::Hash;
use crate::db::Database;
use crate::herder::Herder;
use crate::metrics;
use crate::overlay::floodgate::Floodgate;
use crate::overlay::message::{PeerAddress, StellarMessage};
use crate::overlay::peer::{NodeInfo, Peer, PeerRole};
use crate::overlay::peer_record::PeerRecord;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a peer session's outbound queue. Cheap to clone; the session
/// and the manager share the authenticated flag.
#[derive(Clone)]
pub struct PeerSender {
    pub id: u64,
    authenticated: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl PeerSender {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        PeerSender {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            authenticated: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    pub(crate) fn set_authenticated(&self, v: bool) {
        self.authenticated.store(v, Ordering::Relaxed);
    }

    /// Queue pre-marshalled message bytes. False when the session is gone.
    pub fn send_raw(&self, bytes: Bytes) -> bool {
        self.tx.send(bytes).is_ok()
    }

    pub fn send_message(&self, msg: &StellarMessage) -> bool {
        self.send_raw(Bytes::from(msg.to_xdr()))
    }
}

/// What a peer session consumes from the overlay around it.
#[async_trait]
pub trait OverlayGateway: Send + Sync {
    /// Memoize a message received from `from` for later fan-out.
    fn recv_flooded_msg(&self, msg: &StellarMessage, from: u64);

    /// Fan a message out to every authenticated peer that has not already
    /// seen it.
    fn broadcast_message(&self, msg: &StellarMessage);

    /// Whether a freshly authenticated inbound peer gets a slot.
    fn is_peer_accepted(&self, id: u64) -> bool;

    fn is_shutting_down(&self) -> bool;

    /// Record a completed handshake in the peer table, resetting backoff.
    async fn note_handshake_success(&self, ip: IpAddr, port: u16);

    /// Public peer addresses worth advertising, best first.
    async fn peers_to_advertise(&self) -> Vec<PeerAddress>;

    /// A gossiped address passed the session's validity checks.
    async fn remember_peer(&self, address: PeerAddress);

    /// The session's read loop ended.
    fn peer_closed(&self, id: u64);
}

/// How many peer addresses a single PEERS message advertises.
const MAX_PEERS_TO_SEND: i64 = 50;

pub struct OverlayManager {
    node: NodeInfo,
    db: Arc<Database>,
    herder: Arc<dyn Herder>,
    peers: Mutex<HashMap<u64, PeerSender>>,
    dialing: Mutex<HashSet<(String, u16)>>,
    floodgate: Mutex<Floodgate>,
    current_ledger: AtomicU32,
    shutting_down: AtomicBool,
    target_peer_connections: usize,
}

impl OverlayManager {
    pub fn new(
        node: NodeInfo,
        db: Arc<Database>,
        herder: Arc<dyn Herder>,
        target_peer_connections: usize,
    ) -> Arc<Self> {
        Arc::new(OverlayManager {
            node,
            db,
            herder,
            peers: Mutex::new(HashMap::new()),
            dialing: Mutex::new(HashSet::new()),
            floodgate: Mutex::new(Floodgate::new()),
            current_ledger: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
            target_peer_connections,
        })
    }

    pub fn register_peer(&self, sender: PeerSender) {
        self.peers
            .lock()
            .expect("peer table poisoned")
            .insert(sender.id, sender);
    }

    pub fn authenticated_peer_count(&self) -> usize {
        self.peers
            .lock()
            .expect("peer table poisoned")
            .values()
            .filter(|p| p.is_authenticated())
            .count()
    }

    /// A ledger closed: flood records from older ledgers are dead weight.
    pub fn note_ledger_closed(&self, ledger: u32) {
        self.current_ledger.store(ledger, Ordering::Relaxed);
        self.floodgate
            .lock()
            .expect("floodgate poisoned")
            .clear_below(ledger);
    }

    pub fn current_ledger(&self) -> u32 {
        self.current_ledger.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    /// Start a session for an inbound connection.
    pub fn accept_peer(self: &Arc<Self>, stream: TcpStream, address: SocketAddr) {
        debug!(%address, "accepted inbound peer");
        let (peer, sender) = Peer::new(
            self.node.clone(),
            PeerRole::RemoteCalledUs,
            address,
            self.herder.clone(),
            self.clone() as Arc<dyn OverlayGateway>,
        );
        self.register_peer(sender);
        tokio::spawn(peer.run(stream));
    }

    /// Dial a recorded peer and start a session; push the record's backoff
    /// out on failure.
    pub async fn initiate_peer(self: &Arc<Self>, mut record: PeerRecord) {
        let target = (record.ip.clone(), record.port);
        {
            let mut dialing = self.dialing.lock().expect("dial set poisoned");
            if !dialing.insert(target.clone()) {
                return;
            }
        }

        let addr = format!("{}:{}", record.ip, record.port);
        let result = TcpStream::connect(&addr).await;
        match result {
            Ok(stream) => {
                debug!(%addr, "connected to peer");
                let remote = stream
                    .peer_addr()
                    .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], record.port)));
                let (peer, sender) = Peer::new(
                    self.node.clone(),
                    PeerRole::WeCalledRemote,
                    remote,
                    self.herder.clone(),
                    self.clone() as Arc<dyn OverlayGateway>,
                );
                self.register_peer(sender);
                let manager = self.clone();
                tokio::spawn(async move {
                    peer.run(stream).await;
                    manager
                        .dialing
                        .lock()
                        .expect("dial set poisoned")
                        .remove(&target);
                });
            }
            Err(e) => {
                warn!(%addr, error = %e, "peer connect failed");
                record.back_off(Utc::now());
                if let Err(e) = record.store(self.db.pool()).await {
                    warn!(error = %e, "failed to store peer backoff");
                }
                self.dialing
                    .lock()
                    .expect("dial set poisoned")
                    .remove(&target);
            }
        }
    }

    /// Keep dialing recorded peers until the target connection count is
    /// met. Runs until shutdown.
    pub async fn maintain_connections(self: Arc<Self>, poll_interval: Duration) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            if self.is_shutting_down() {
                break;
            }
            let connected = self.authenticated_peer_count();
            if connected >= self.target_peer_connections {
                continue;
            }
            let want = (self.target_peer_connections - connected) as i64;
            let records = match PeerRecord::load_records(self.db.pool(), want, Utc::now()).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "failed to load peer records");
                    continue;
                }
            };
            for record in records {
                self.initiate_peer(record).await;
            }
        }
        info!("connection maintenance stopped");
    }

    fn send_to_peers(&self, msg: &StellarMessage, exclude: &[u64]) {
        let bytes = Bytes::from(msg.to_xdr());
        let peers = self.peers.lock().expect("peer table poisoned");
        let mut sent = 0u64;
        for (id, sender) in peers.iter() {
            if exclude.contains(id) || !sender.is_authenticated() {
                continue;
            }
            if sender.send_raw(bytes.clone()) {
                sent += 1;
            }
        }
        metrics::MESSAGES_BROADCAST
            .with_label_values(&[msg.message_type().name()])
            .inc_by(sent as f64);
    }

    fn flood_index_record(&self, index: &Hash) -> bool {
        self.floodgate
            .lock()
            .expect("floodgate poisoned")
            .contains(index)
    }
}

#[async_trait]
impl OverlayGateway for OverlayManager {
    fn recv_flooded_msg(&self, msg: &StellarMessage, from: u64) {
        let index = msg.flood_index();
        self.floodgate
            .lock()
            .expect("floodgate poisoned")
            .add_record(index, msg.clone(), self.current_ledger(), from);
    }

    fn broadcast_message(&self, msg: &StellarMessage) {
        let index = msg.flood_index();
        if self.flood_index_record(&index) {
            // the floodgate knows who already has it
            let gate = self.floodgate.lock().expect("floodgate poisoned");
            gate.broadcast(&index, |message, exclude| {
                self.send_to_peers(message, exclude);
            });
        } else {
            // self-originated: everyone gets it
            self.send_to_peers(msg, &[]);
        }
    }

    fn is_peer_accepted(&self, id: u64) -> bool {
        let peers = self.peers.lock().expect("peer table poisoned");
        let others = peers
            .iter()
            .filter(|(pid, p)| **pid != id && p.is_authenticated())
            .count();
        others < self.target_peer_connections
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    async fn note_handshake_success(&self, ip: IpAddr, port: u16) {
        let ip = ip.to_string();
        let now = Utc::now();
        let result = match PeerRecord::load(self.db.pool(), &ip, port).await {
            Ok(Some(mut record)) => {
                record.reset_back_off(now);
                info!(peer = %format!("{}:{}", record.ip, record.port), "successful handshake");
                record.store(self.db.pool()).await
            }
            Ok(None) => {
                let record = PeerRecord::new(ip, port, now);
                info!(peer = %format!("{}:{}", record.ip, record.port), "successful handshake");
                record.store(self.db.pool()).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to record handshake success");
        }
    }

    async fn peers_to_advertise(&self) -> Vec<PeerAddress> {
        match PeerRecord::load_records(self.db.pool(), MAX_PEERS_TO_SEND, Utc::now()).await {
            Ok(records) => records
                .iter()
                .filter(|r| !r.is_private_address())
                .filter_map(PeerRecord::to_address)
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to load peer records for advertisement");
                Vec::new()
            }
        }
    }

    async fn remember_peer(&self, address: PeerAddress) {
        let record = PeerRecord::from_address(&address, Utc::now());
        if let Err(e) = record.insert_if_new(self.db.pool()).await {
            debug!(error = %e, "failed to remember gossiped peer");
        }
    }

    fn peer_closed(&self, id: u64) {
        self.peers.lock().expect("peer table poisoned").remove(&id);
    }
}
