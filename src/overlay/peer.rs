//! Per-connection peer session: handshake, dispatch, flood forwarding.
//!
//! The session owns both halves of the framed transport: a read loop that
//! drives the state machine and a writer task draining the outbound queue.
//! Dropping the session is a single state flip observed by both halves.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::crypto::{random_nonce, sha256, NodeSeed, PublicKey};
use crate::herder::{Herder, TxSetFrame, TxStatus};
use crate::metrics;
use crate::overlay::frame;
use crate::overlay::manager::{OverlayGateway, PeerSender};
use crate::overlay::message::{
    Auth, DontHave, ErrorMsg, Hello, MessageType, PeerAddress, ScpQuorumSet, StellarMessage,
};
use crate::overlay::peer_record::is_private_address;

/// Identity and protocol parameters this node presents in HELLO.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub seed: NodeSeed,
    pub network_id: [u8; 32],
    pub ledger_version: u32,
    pub overlay_version: u32,
    pub version_str: String,
    pub listening_port: u16,
}

impl NodeInfo {
    pub fn public_key(&self) -> PublicKey {
        self.seed.public_key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    WeCalledRemote,
    RemoteCalledUs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    GotHello,
    GotAuth,
    Closing,
}

pub struct Peer {
    info: NodeInfo,
    role: PeerRole,
    state: PeerState,
    address: SocketAddr,
    remote_overlay_version: u32,
    remote_version: String,
    remote_listening_port: u16,
    peer_id: Option<PublicKey>,
    sent_nonce: [u8; 32],
    received_nonce: [u8; 32],
    sender: PeerSender,
    outbound_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    herder: Arc<dyn Herder>,
    overlay: Arc<dyn OverlayGateway>,
}

impl Peer {
    /// Build a session and the overlay-facing handle to its outbound queue.
    pub fn new(
        info: NodeInfo,
        role: PeerRole,
        address: SocketAddr,
        herder: Arc<dyn Herder>,
        overlay: Arc<dyn OverlayGateway>,
    ) -> (Peer, PeerSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = PeerSender::new(tx);
        let peer = Peer {
            info,
            role,
            state: match role {
                PeerRole::WeCalledRemote => PeerState::Connecting,
                PeerRole::RemoteCalledUs => PeerState::Connected,
            },
            address,
            remote_overlay_version: 0,
            remote_version: String::new(),
            remote_listening_port: 0,
            peer_id: None,
            sent_nonce: [0; 32],
            received_nonce: [0; 32],
            sender: sender.clone(),
            outbound_rx: Some(rx),
            herder,
            overlay,
        };
        (peer, sender)
    }

    pub fn id(&self) -> u64 {
        self.sender.id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state != PeerState::Connecting && self.state != PeerState::Closing
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == PeerState::GotAuth
    }

    pub fn peer_id(&self) -> Option<PublicKey> {
        self.peer_id
    }

    pub fn remote_version(&self) -> &str {
        &self.remote_version
    }

    pub fn remote_overlay_version(&self) -> u32 {
        self.remote_overlay_version
    }

    pub fn remote_listening_port(&self) -> u16 {
        self.remote_listening_port
    }

    fn should_abort(&self) -> bool {
        self.state == PeerState::Closing || self.overlay.is_shutting_down()
    }

    fn peer_label(&self) -> String {
        format!("{}:{}", self.address.ip(), self.remote_listening_port)
    }

    /// Drive the session over a connected stream until it closes.
    pub async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut rx = self.outbound_rx.take().expect("session already running");
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let writer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    queued = rx.recv() => match queued {
                        Some(bytes) => {
                            if frame::write_frame(&mut writer, &bytes).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = &mut close_rx => {
                        // flush frames queued before the close, then stop
                        while let Ok(bytes) = rx.try_recv() {
                            if frame::write_frame(&mut writer, &bytes).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
        });

        if self.role == PeerRole::WeCalledRemote {
            // the caller hands us a connected socket
            self.state = PeerState::Connected;
            self.send_hello();
        }

        loop {
            if self.should_abort() {
                break;
            }
            match frame::read_frame(&mut reader).await {
                Ok(body) => match StellarMessage::from_xdr(&body) {
                    Ok(msg) => self.recv_message(msg).await,
                    Err(e) => {
                        trace!(peer = %self.peer_label(), error = %e, "received corrupt message");
                        self.drop_peer("bad-xdr");
                    }
                },
                Err(_) => {
                    self.drop_peer("read-error");
                }
            }
        }

        let _ = close_tx.send(());
        let _ = writer_task.await;
        self.overlay.peer_closed(self.id());
    }

    /// Flip the session to closing. Idempotent; further inbound bytes are
    /// discarded and the outbound queue is abandoned.
    pub fn drop_peer(&mut self, reason: &str) {
        if self.state == PeerState::Closing {
            return;
        }
        if self.state == PeerState::GotAuth {
            metrics::AUTHENTICATED_PEERS.dec();
        }
        self.state = PeerState::Closing;
        self.sender.set_authenticated(false);
        metrics::record_peer_dropped(reason);
    }

    fn send_message(&self, msg: &StellarMessage) {
        trace!(
            from = %self.info.public_key().short_string(),
            to = ?self.peer_id.map(|k| k.short_string()),
            msg_type = msg.message_type().name(),
            "send"
        );
        // a closed queue means the writer is gone; the read loop will find out
        let _ = self.sender.send_raw(Bytes::from(msg.to_xdr()));
    }

    fn send_hello(&mut self) {
        debug!(peer = %self.peer_label(), "sending hello");
        self.sent_nonce = random_nonce();
        self.send_message(&StellarMessage::Hello(Hello {
            ledger_version: self.info.ledger_version,
            overlay_version: self.info.overlay_version,
            version_str: self.info.version_str.clone(),
            network_id: self.info.network_id,
            listening_port: self.info.listening_port as i32,
            peer_id: self.info.public_key(),
            nonce: self.sent_nonce,
        }));
    }

    fn send_auth(&self) {
        // we do not want to sign things wholly under the control of the peer
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&self.sent_nonce);
        bytes.extend_from_slice(&self.received_nonce);
        self.send_message(&StellarMessage::Auth(Auth {
            signature: self.info.seed.sign(&bytes),
        }));
    }

    pub fn send_dont_have(&self, message_type: MessageType, item: [u8; 32]) {
        self.send_message(&StellarMessage::DontHave(DontHave {
            message_type,
            req_hash: item,
        }));
    }

    pub fn send_get_tx_set(&self, set_id: [u8; 32]) {
        self.send_message(&StellarMessage::GetTxSet(set_id));
    }

    pub fn send_get_quorum_set(&self, set_id: [u8; 32]) {
        self.send_message(&StellarMessage::GetScpQuorumSet(set_id));
    }

    pub fn send_scp_quorum_set(&self, qset: ScpQuorumSet) {
        self.send_message(&StellarMessage::ScpQuorumSet(qset));
    }

    async fn send_peers(&self) {
        let peers = self.overlay.peers_to_advertise().await;
        self.send_message(&StellarMessage::Peers(peers));
    }

    async fn recv_message(&mut self, msg: StellarMessage) {
        let msg_type = msg.message_type();
        let _timer = metrics::recv_timer(msg_type.name());
        trace!(
            to = %self.info.public_key().short_string(),
            from = ?self.peer_id.map(|k| k.short_string()),
            msg_type = msg_type.name(),
            "recv"
        );

        if self.state != PeerState::GotAuth
            && !matches!(
                msg_type,
                MessageType::Hello | MessageType::Auth | MessageType::Peers
            )
        {
            warn!(
                peer = %self.peer_label(),
                msg_type = msg_type.name(),
                "received message before completed handshake"
            );
            self.drop_peer("pre-auth-message");
            return;
        }

        match msg {
            StellarMessage::Error(e) => self.recv_error(e),
            StellarMessage::Hello(hello) => self.recv_hello(hello),
            StellarMessage::Auth(auth) => self.recv_auth(auth).await,
            StellarMessage::DontHave(dont_have) => self.recv_dont_have(dont_have).await,
            StellarMessage::GetPeers => self.send_peers().await,
            StellarMessage::Peers(peers) => self.recv_peers(peers).await,
            StellarMessage::GetTxSet(hash) => self.recv_get_tx_set(hash).await,
            StellarMessage::TxSet(tx_set) => {
                let frame = TxSetFrame::from_wire(tx_set);
                self.herder.recv_tx_set(frame.contents_hash(), frame).await;
            }
            StellarMessage::Transaction(ref tx) => {
                if self.herder.recv_transaction(tx.clone()).await == TxStatus::Pending {
                    self.overlay.recv_flooded_msg(&msg, self.id());
                    self.overlay.broadcast_message(&msg);
                }
            }
            StellarMessage::GetScpQuorumSet(hash) => self.recv_get_scp_quorum_set(hash).await,
            StellarMessage::ScpQuorumSet(qset) => {
                let hash = sha256(&qset.0);
                self.herder.recv_scp_quorum_set(hash, qset).await;
            }
            StellarMessage::ScpMessage(ref envelope) => {
                self.overlay.recv_flooded_msg(&msg, self.id());
                self.herder.recv_scp_envelope(envelope.clone()).await;
            }
        }
    }

    fn recv_error(&self, e: ErrorMsg) {
        debug!(peer = %self.peer_label(), code = e.code, msg = %e.msg, "peer reported error");
    }

    fn recv_hello(&mut self, hello: Hello) {
        if hello.peer_id == self.info.public_key() {
            debug!("connecting to self");
            self.drop_peer("self-connect");
            return;
        }

        if hello.network_id != self.info.network_id {
            info!(peer = %self.peer_label(), "connection from misconfigured peer");
            self.drop_peer("wrong-network");
            return;
        }

        self.remote_overlay_version = hello.overlay_version;
        self.remote_version = hello.version_str;

        if hello.listening_port <= 0 || hello.listening_port > u16::MAX as i32 {
            debug!(port = hello.listening_port, "bad listening port in hello");
            self.drop_peer("bad-port");
            return;
        }
        self.remote_listening_port = hello.listening_port as u16;

        debug!(peer = %self.peer_label(), "received hello");
        self.state = PeerState::GotHello;
        self.peer_id = Some(hello.peer_id);
        self.received_nonce = hello.nonce;

        if self.role == PeerRole::WeCalledRemote {
            self.send_auth();
        } else {
            self.send_hello();
        }
    }

    async fn recv_auth(&mut self, auth: Auth) {
        if self.state != PeerState::GotHello {
            error!(peer = %self.peer_label(), "unexpected AUTH message");
            self.drop_peer("unexpected-auth");
            return;
        }

        // the verifier's received nonce is the signer's sent nonce
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&self.received_nonce);
        bytes.extend_from_slice(&self.sent_nonce);

        let peer_id = self.peer_id.expect("peer id set on hello");
        if !peer_id.verify(&bytes, &auth.signature) {
            error!(peer = %self.peer_label(), "bad signature on AUTH message");
            self.drop_peer("bad-auth-signature");
            return;
        }

        self.overlay
            .note_handshake_success(self.address.ip(), self.remote_listening_port)
            .await;

        self.state = PeerState::GotAuth;
        self.sender.set_authenticated(true);
        metrics::AUTHENTICATED_PEERS.inc();

        if self.role == PeerRole::RemoteCalledUs {
            if self.overlay.is_peer_accepted(self.id()) {
                self.send_auth();
                self.send_peers().await;
            } else {
                warn!(peer = %self.peer_label(), "new peer rejected, all slots taken");
                self.send_peers().await;
                self.drop_peer("no-slots");
            }
        }
    }

    async fn recv_dont_have(&self, dont_have: DontHave) {
        self.herder
            .peer_doesnt_have(dont_have.message_type, dont_have.req_hash, self.id())
            .await;
    }

    async fn recv_peers(&self, peers: Vec<PeerAddress>) {
        for address in peers {
            if address.port == 0 || address.port > u16::MAX as u32 {
                debug!(port = address.port, "ignoring peer with bad port");
                continue;
            }
            if is_private_address(address.ip) {
                debug!("ignoring flooded private address");
                continue;
            }
            self.overlay.remember_peer(address).await;
        }
    }

    async fn recv_get_tx_set(&self, hash: [u8; 32]) {
        match self.herder.get_tx_set(&hash).await {
            Some(tx_set) => {
                self.send_message(&StellarMessage::TxSet(tx_set.to_wire()));
            }
            None => self.send_dont_have(MessageType::TxSet, hash),
        }
    }

    async fn recv_get_scp_quorum_set(&self, hash: [u8; 32]) {
        match self.herder.get_qset(&hash).await {
            Some(qset) => self.send_scp_quorum_set(qset),
            None => {
                trace!(qset = %crate::crypto::hex_abbrev(&hash), "no quorum set");
                self.send_dont_have(MessageType::ScpQuorumSet, hash);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    use crate::herder::InMemoryHerder;
    use crate::overlay::message::TransactionEnvelope;

    struct MockOverlay {
        accept: bool,
        notes: AtomicUsize,
        flooded: Mutex<Vec<u64>>,
        broadcasts: Mutex<Vec<StellarMessage>>,
        advertised: Vec<PeerAddress>,
        remembered: Mutex<Vec<PeerAddress>>,
    }

    impl MockOverlay {
        fn new(accept: bool) -> Arc<Self> {
            Self::with_advertised(accept, Vec::new())
        }

        fn with_advertised(accept: bool, advertised: Vec<PeerAddress>) -> Arc<Self> {
            Arc::new(MockOverlay {
                accept,
                notes: AtomicUsize::new(0),
                flooded: Mutex::new(Vec::new()),
                broadcasts: Mutex::new(Vec::new()),
                advertised,
                remembered: Mutex::new(Vec::new()),
            })
        }

        fn note_count(&self) -> usize {
            self.notes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OverlayGateway for MockOverlay {
        fn recv_flooded_msg(&self, _msg: &StellarMessage, from: u64) {
            self.flooded.lock().unwrap().push(from);
        }

        fn broadcast_message(&self, msg: &StellarMessage) {
            self.broadcasts.lock().unwrap().push(msg.clone());
        }

        fn is_peer_accepted(&self, _id: u64) -> bool {
            self.accept
        }

        fn is_shutting_down(&self) -> bool {
            false
        }

        async fn note_handshake_success(&self, _ip: std::net::IpAddr, _port: u16) {
            self.notes.fetch_add(1, Ordering::SeqCst);
        }

        async fn peers_to_advertise(&self) -> Vec<PeerAddress> {
            self.advertised.clone()
        }

        async fn remember_peer(&self, address: PeerAddress) {
            self.remembered.lock().unwrap().push(address);
        }

        fn peer_closed(&self, _id: u64) {}
    }

    fn node_info(seed: u8, network: u8) -> NodeInfo {
        NodeInfo {
            seed: NodeSeed::from_bytes([seed; 32]),
            network_id: [network; 32],
            ledger_version: 1,
            overlay_version: 1,
            version_str: format!("lumen-node test {}", seed),
            listening_port: 11625,
        }
    }

    fn remote_addr() -> SocketAddr {
        "198.51.100.7:39000".parse().unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, f: F) {
        for _ in 0..500 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    async fn send_msg(stream: &mut DuplexStream, msg: &StellarMessage) {
        frame::write_frame(stream, &msg.to_xdr()).await.unwrap();
    }

    async fn recv_msg(stream: &mut DuplexStream) -> StellarMessage {
        let body = timeout(Duration::from_secs(5), frame::read_frame(stream))
            .await
            .expect("read timed out")
            .expect("stream closed");
        StellarMessage::from_xdr(&body).expect("bad message from peer")
    }

    fn spawn_session(
        info: NodeInfo,
        role: PeerRole,
        overlay: Arc<MockOverlay>,
        stream: DuplexStream,
    ) -> (PeerSender, tokio::task::JoinHandle<()>) {
        let herder = Arc::new(InMemoryHerder::new());
        let (peer, sender) = Peer::new(info, role, remote_addr(), herder, overlay);
        let handle = tokio::spawn(peer.run(stream));
        (sender, handle)
    }

    #[tokio::test]
    async fn test_handshake_symmetry() {
        let (stream_a, stream_b) = tokio::io::duplex(1 << 16);
        let overlay_a = MockOverlay::new(true);
        let overlay_b = MockOverlay::new(true);

        let (sender_a, _) = spawn_session(
            node_info(1, 0),
            PeerRole::WeCalledRemote,
            overlay_a.clone(),
            stream_a,
        );
        let (sender_b, _) = spawn_session(
            node_info(2, 0),
            PeerRole::RemoteCalledUs,
            overlay_b.clone(),
            stream_b,
        );

        wait_until("both sides authenticated", || {
            sender_a.is_authenticated() && sender_b.is_authenticated()
        })
        .await;
        assert_eq!(overlay_a.note_count(), 1);
        assert_eq!(overlay_b.note_count(), 1);
    }

    #[tokio::test]
    async fn test_self_connect_is_dropped() {
        let (stream_a, stream_b) = tokio::io::duplex(1 << 16);
        let overlay_a = MockOverlay::new(true);
        let overlay_b = MockOverlay::new(true);

        // same identity on both ends
        let (sender_a, handle_a) = spawn_session(
            node_info(1, 0),
            PeerRole::WeCalledRemote,
            overlay_a.clone(),
            stream_a,
        );
        let (sender_b, handle_b) = spawn_session(
            node_info(1, 0),
            PeerRole::RemoteCalledUs,
            overlay_b.clone(),
            stream_b,
        );

        timeout(Duration::from_secs(5), handle_a).await.unwrap().unwrap();
        timeout(Duration::from_secs(5), handle_b).await.unwrap().unwrap();
        assert!(!sender_a.is_authenticated());
        assert!(!sender_b.is_authenticated());
        assert_eq!(overlay_a.note_count(), 0);
        assert_eq!(overlay_b.note_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_network_is_dropped() {
        let (stream_a, stream_b) = tokio::io::duplex(1 << 16);
        let overlay_a = MockOverlay::new(true);
        let overlay_b = MockOverlay::new(true);

        let (sender_a, handle_a) = spawn_session(
            node_info(1, 0),
            PeerRole::WeCalledRemote,
            overlay_a,
            stream_a,
        );
        let (_, handle_b) = spawn_session(
            node_info(2, 9),
            PeerRole::RemoteCalledUs,
            overlay_b,
            stream_b,
        );

        timeout(Duration::from_secs(5), handle_a).await.unwrap().unwrap();
        timeout(Duration::from_secs(5), handle_b).await.unwrap().unwrap();
        assert!(!sender_a.is_authenticated());
    }

    #[tokio::test]
    async fn test_pre_auth_message_is_dropped() {
        let (mut driver, stream) = tokio::io::duplex(1 << 16);
        let overlay = MockOverlay::new(true);
        let (sender, handle) = spawn_session(
            node_info(2, 0),
            PeerRole::RemoteCalledUs,
            overlay.clone(),
            stream,
        );

        let tx = StellarMessage::Transaction(TransactionEnvelope(vec![1, 2, 3]));
        send_msg(&mut driver, &tx).await;

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(!sender.is_authenticated());
        assert!(overlay.broadcasts.lock().unwrap().is_empty());
    }

    /// Drive the remote side of the handshake by hand, through our hello
    /// and the peer's reply. Returns our nonce and the peer's nonce.
    async fn drive_hello(
        driver: &mut DuplexStream,
        driver_info: &NodeInfo,
    ) -> ([u8; 32], [u8; 32], PublicKey) {
        let our_nonce = random_nonce();
        send_msg(
            driver,
            &StellarMessage::Hello(Hello {
                ledger_version: driver_info.ledger_version,
                overlay_version: driver_info.overlay_version,
                version_str: driver_info.version_str.clone(),
                network_id: driver_info.network_id,
                listening_port: driver_info.listening_port as i32,
                peer_id: driver_info.public_key(),
                nonce: our_nonce,
            }),
        )
        .await;

        match recv_msg(driver).await {
            StellarMessage::Hello(hello) => (our_nonce, hello.nonce, hello.peer_id),
            other => panic!("expected hello reply, got {:?}", other.message_type()),
        }
    }

    #[tokio::test]
    async fn test_auth_succeeds_and_peers_follow() {
        let advertised = vec![PeerAddress {
            ip: [203, 0, 113, 5],
            port: 11625,
            num_failures: 0,
        }];
        let (mut driver, stream) = tokio::io::duplex(1 << 16);
        let overlay = MockOverlay::with_advertised(true, advertised.clone());
        let (sender, _) = spawn_session(
            node_info(2, 0),
            PeerRole::RemoteCalledUs,
            overlay.clone(),
            stream,
        );

        let driver_info = node_info(1, 0);
        let (our_nonce, peer_nonce, peer_id) = drive_hello(&mut driver, &driver_info).await;

        let mut signed = Vec::new();
        signed.extend_from_slice(&our_nonce);
        signed.extend_from_slice(&peer_nonce);
        send_msg(
            &mut driver,
            &StellarMessage::Auth(Auth {
                signature: driver_info.seed.sign(&signed),
            }),
        )
        .await;

        // an accepted inbound peer gets AUTH then PEERS
        match recv_msg(&mut driver).await {
            StellarMessage::Auth(auth) => {
                let mut peer_signed = Vec::new();
                peer_signed.extend_from_slice(&peer_nonce);
                peer_signed.extend_from_slice(&our_nonce);
                assert!(peer_id.verify(&peer_signed, &auth.signature));
            }
            other => panic!("expected auth, got {:?}", other.message_type()),
        }
        match recv_msg(&mut driver).await {
            StellarMessage::Peers(peers) => assert_eq!(peers, advertised),
            other => panic!("expected peers, got {:?}", other.message_type()),
        }

        assert!(sender.is_authenticated());
        assert_eq!(overlay.note_count(), 1);
    }

    #[tokio::test]
    async fn test_auth_bit_flip_is_dropped() {
        let (mut driver, stream) = tokio::io::duplex(1 << 16);
        let overlay = MockOverlay::new(true);
        let (sender, handle) = spawn_session(
            node_info(2, 0),
            PeerRole::RemoteCalledUs,
            overlay.clone(),
            stream,
        );

        let driver_info = node_info(1, 0);
        let (our_nonce, peer_nonce, _) = drive_hello(&mut driver, &driver_info).await;

        let mut signed = Vec::new();
        signed.extend_from_slice(&our_nonce);
        signed.extend_from_slice(&peer_nonce);
        let mut signature = driver_info.seed.sign(&signed);
        signature[17] ^= 0x01;
        send_msg(&mut driver, &StellarMessage::Auth(Auth { signature })).await;

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(!sender.is_authenticated());
        assert_eq!(overlay.note_count(), 0);
    }

    #[tokio::test]
    async fn test_auth_over_flipped_nonce_is_dropped() {
        let (mut driver, stream) = tokio::io::duplex(1 << 16);
        let overlay = MockOverlay::new(true);
        let (sender, handle) = spawn_session(
            node_info(2, 0),
            PeerRole::RemoteCalledUs,
            overlay.clone(),
            stream,
        );

        let driver_info = node_info(1, 0);
        let (our_nonce, peer_nonce, _) = drive_hello(&mut driver, &driver_info).await;

        // sign over a corrupted copy of the peer's nonce
        let mut wrong_nonce = peer_nonce;
        wrong_nonce[0] ^= 0x80;
        let mut signed = Vec::new();
        signed.extend_from_slice(&our_nonce);
        signed.extend_from_slice(&wrong_nonce);
        send_msg(
            &mut driver,
            &StellarMessage::Auth(Auth {
                signature: driver_info.seed.sign(&signed),
            }),
        )
        .await;

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(!sender.is_authenticated());
    }

    #[tokio::test]
    async fn test_rejected_peer_still_receives_peers() {
        let advertised = vec![PeerAddress {
            ip: [203, 0, 113, 9],
            port: 11625,
            num_failures: 1,
        }];
        let (mut driver, stream) = tokio::io::duplex(1 << 16);
        let overlay = MockOverlay::with_advertised(false, advertised.clone());
        let (_, handle) = spawn_session(
            node_info(2, 0),
            PeerRole::RemoteCalledUs,
            overlay.clone(),
            stream,
        );

        let driver_info = node_info(1, 0);
        let (our_nonce, peer_nonce, _) = drive_hello(&mut driver, &driver_info).await;
        let mut signed = Vec::new();
        signed.extend_from_slice(&our_nonce);
        signed.extend_from_slice(&peer_nonce);
        send_msg(
            &mut driver,
            &StellarMessage::Auth(Auth {
                signature: driver_info.seed.sign(&signed),
            }),
        )
        .await;

        // a rejected peer still gets peer hints before the drop
        match recv_msg(&mut driver).await {
            StellarMessage::Peers(peers) => assert_eq!(peers, advertised),
            other => panic!("expected peers, got {:?}", other.message_type()),
        }
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    async fn authenticate_driver(
        driver: &mut DuplexStream,
        driver_info: &NodeInfo,
    ) -> PublicKey {
        let (our_nonce, peer_nonce, peer_id) = drive_hello(driver, driver_info).await;
        let mut signed = Vec::new();
        signed.extend_from_slice(&our_nonce);
        signed.extend_from_slice(&peer_nonce);
        send_msg(
            driver,
            &StellarMessage::Auth(Auth {
                signature: driver_info.seed.sign(&signed),
            }),
        )
        .await;
        // drain the accept-side AUTH and PEERS
        match recv_msg(driver).await {
            StellarMessage::Auth(_) => {}
            other => panic!("expected auth, got {:?}", other.message_type()),
        }
        match recv_msg(driver).await {
            StellarMessage::Peers(_) => {}
            other => panic!("expected peers, got {:?}", other.message_type()),
        }
        peer_id
    }

    #[tokio::test]
    async fn test_pending_transaction_is_flooded() {
        let (mut driver, stream) = tokio::io::duplex(1 << 16);
        let overlay = MockOverlay::new(true);
        let (sender, _) = spawn_session(
            node_info(2, 0),
            PeerRole::RemoteCalledUs,
            overlay.clone(),
            stream,
        );

        let driver_info = node_info(1, 0);
        authenticate_driver(&mut driver, &driver_info).await;

        let tx = StellarMessage::Transaction(TransactionEnvelope(vec![5, 6, 7]));
        send_msg(&mut driver, &tx).await;
        wait_until("transaction flooded", || {
            !overlay.broadcasts.lock().unwrap().is_empty()
        })
        .await;

        assert_eq!(*overlay.flooded.lock().unwrap(), vec![sender.id]);
        assert_eq!(*overlay.broadcasts.lock().unwrap(), vec![tx.clone()]);

        // a duplicate is not flooded again
        send_msg(&mut driver, &tx).await;
        send_msg(&mut driver, &StellarMessage::GetPeers).await;
        match recv_msg(&mut driver).await {
            StellarMessage::Peers(_) => {}
            other => panic!("expected peers, got {:?}", other.message_type()),
        }
        assert_eq!(overlay.broadcasts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gossiped_private_and_bad_port_addresses_ignored() {
        let (mut driver, stream) = tokio::io::duplex(1 << 16);
        let overlay = MockOverlay::new(true);
        let _session = spawn_session(
            node_info(2, 0),
            PeerRole::RemoteCalledUs,
            overlay.clone(),
            stream,
        );

        let driver_info = node_info(1, 0);
        authenticate_driver(&mut driver, &driver_info).await;

        let good = PeerAddress {
            ip: [203, 0, 113, 80],
            port: 11625,
            num_failures: 0,
        };
        send_msg(
            &mut driver,
            &StellarMessage::Peers(vec![
                PeerAddress {
                    ip: [192, 168, 1, 4],
                    port: 11625,
                    num_failures: 0,
                },
                PeerAddress {
                    ip: [203, 0, 113, 81],
                    port: 0,
                    num_failures: 0,
                },
                PeerAddress {
                    ip: [203, 0, 113, 82],
                    port: 70000,
                    num_failures: 0,
                },
                good.clone(),
            ]),
        )
        .await;

        wait_until("good address remembered", || {
            !overlay.remembered.lock().unwrap().is_empty()
        })
        .await;
        assert_eq!(*overlay.remembered.lock().unwrap(), vec![good]);
    }
}
