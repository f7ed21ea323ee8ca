//! Outbound session supervisor.
//!
//! The connector keeps exactly one outbound session per node id in the
//! PKI's outgoing destination set. A PKI update kicks [`Connector::
//! force_update`], which diff-reconciles the session table: new peers get
//! sessions spawned, delisted peers get theirs halted, the rest stay
//! untouched.
//!
//! Each session walks `Idle → Connecting → Authenticated → Sending` and
//! reconnects from failures with exponential backoff. [`Connector::send`]
//! returns immediately; enqueueing onto the session is best-effort and a
//! packet with no live session is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use veil_crypto::ed25519::SigningKey;
use veil_transport::quic::LinkNode;
use veil_transport::wire::{self, Hello, PeerCredentials};
use veil_types::{node_id_to_print_string, NodeId};

use crate::packet::Counters;
use crate::pki::Pki;
use crate::scheduler::Dispatch;
use crate::Result;

/// Initial reconnect backoff.
const BACKOFF_FLOOR: Duration = Duration::from_secs(1);

/// Backoff ceiling.
const BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Per-session egress buffer depth. Packets beyond it are shed.
const SESSION_QUEUE_DEPTH: usize = 64;

/// Outbound session lifecycle, for observability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    Idle,
    Connecting,
    Authenticated,
    Sending,
    Closing,
}

struct OutboundSession {
    tx: mpsc::Sender<Vec<u8>>,
    halt_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// The outbound connection manager.
pub struct Connector {
    link: Arc<LinkNode>,
    pki: Arc<Pki>,
    identity: Arc<SigningKey>,
    link_public: [u8; 32],
    sessions: Mutex<HashMap<NodeId, OutboundSession>>,
    update_tx: mpsc::Sender<()>,
    halt_tx: broadcast::Sender<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Connector {
    /// Bring up the connector: binds its dialing endpoint and spawns the
    /// reconcile supervisor.
    ///
    /// # Errors
    ///
    /// Propagates endpoint setup failures.
    pub fn new(
        pki: Arc<Pki>,
        identity: Arc<SigningKey>,
        link_public: [u8; 32],
        counters: Arc<Counters>,
    ) -> Result<Arc<Self>> {
        let link = Arc::new(LinkNode::new(veil_transport::quic::LinkConfig::default())?);
        let (update_tx, update_rx) = mpsc::channel(1);
        let (halt_tx, halt_rx) = broadcast::channel(1);

        let connector = Arc::new(Self {
            link,
            pki,
            identity,
            link_public,
            sessions: Mutex::new(HashMap::new()),
            update_tx,
            halt_tx,
            supervisor: Mutex::new(None),
            counters,
        });

        let handle = tokio::spawn(supervisor_task(Arc::clone(&connector), update_rx, halt_rx));
        *connector.supervisor.lock().expect("supervisor lock") = Some(handle);

        Ok(connector)
    }

    /// Kick the supervisor to re-reconcile against the PKI's current
    /// outgoing destination set. Coalesces with a pending kick.
    pub fn force_update(&self) {
        let _ = self.update_tx.try_send(());
    }

    /// Hand a packet to the next hop's session. Returns immediately;
    /// drops (with accounting) if the peer has no live session or its
    /// queue is full.
    pub fn send(&self, next_hop: NodeId, packet: Vec<u8>) {
        let sessions = self.sessions.lock().expect("session table lock");
        match sessions.get(&next_hop) {
            Some(session) => {
                if session.tx.try_send(packet).is_err() {
                    Counters::incr(&self.counters.no_session_drops);
                    debug!(
                        peer = %node_id_to_print_string(&next_hop),
                        "session queue full, dropping packet"
                    );
                }
            }
            None => {
                Counters::incr(&self.counters.no_session_drops);
                debug!(
                    peer = %node_id_to_print_string(&next_hop),
                    "no live session, dropping packet"
                );
            }
        }
    }

    /// Halt the supervisor and every session, in that order.
    pub async fn halt(&self) {
        let _ = self.halt_tx.send(());

        let supervisor = self.supervisor.lock().expect("supervisor lock").take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        let drained: Vec<OutboundSession> = {
            let mut sessions = self.sessions.lock().expect("session table lock");
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            let _ = session.halt_tx.send(());
            let _ = session.handle.await;
        }

        self.link.close();
    }

    fn reconcile(self: &Arc<Self>) {
        let dests = self.pki.outgoing_destinations();
        let mut sessions = self.sessions.lock().expect("session table lock");

        let stale: Vec<NodeId> = sessions
            .keys()
            .filter(|id| !dests.contains_key(*id))
            .copied()
            .collect();
        for id in stale {
            if let Some(session) = sessions.remove(&id) {
                info!(peer = %node_id_to_print_string(&id), "halting delisted session");
                let _ = session.halt_tx.send(());
                tokio::spawn(async move {
                    let _ = session.handle.await;
                });
            }
        }

        for (id, desc) in dests {
            if sessions.contains_key(&id) {
                continue;
            }
            let Some(addr) = desc.addresses.iter().find_map(|a| a.parse::<SocketAddr>().ok())
            else {
                warn!(
                    peer = %node_id_to_print_string(&id),
                    "descriptor has no parseable address, skipping session"
                );
                continue;
            };

            let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
            let (session_halt_tx, session_halt_rx) = broadcast::channel(1);
            info!(
                peer = %node_id_to_print_string(&id),
                %addr,
                "spawning outbound session"
            );
            let handle = tokio::spawn(session_task(
                Arc::clone(&self.link),
                Arc::clone(&self.pki),
                Arc::clone(&self.identity),
                self.link_public,
                id,
                addr,
                rx,
                session_halt_rx,
            ));
            sessions.insert(
                id,
                OutboundSession {
                    tx,
                    halt_tx: session_halt_tx,
                    handle,
                },
            );
        }
    }

    #[cfg(test)]
    fn session_peers(&self) -> Vec<NodeId> {
        self.sessions
            .lock()
            .expect("session table lock")
            .keys()
            .copied()
            .collect()
    }
}

impl Dispatch for Connector {
    fn dispatch(&self, next_hop: NodeId, packet: Vec<u8>) {
        self.send(next_hop, packet);
    }
}

async fn supervisor_task(
    connector: Arc<Connector>,
    mut update_rx: mpsc::Receiver<()>,
    mut halt_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = halt_rx.recv() => {
                debug!("connector supervisor terminating");
                return;
            }
            kick = update_rx.recv() => {
                match kick {
                    Some(()) => connector.reconcile(),
                    None => return,
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn session_task(
    link: Arc<LinkNode>,
    pki: Arc<Pki>,
    identity: Arc<SigningKey>,
    link_public: [u8; 32],
    peer_id: NodeId,
    addr: SocketAddr,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut halt_rx: broadcast::Receiver<()>,
) {
    let peer = node_id_to_print_string(&peer_id);
    let mut state = SessionState::Idle;
    debug!(%peer, ?state, "session created");
    let mut backoff = BACKOFF_FLOOR;

    'reconnect: loop {
        state = SessionState::Connecting;
        debug!(%peer, ?state, "session state");

        let conn = tokio::select! {
            _ = halt_rx.recv() => break 'reconnect,
            result = link.connect(addr) => result,
        };
        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                debug!(%peer, "connect failed: {e}");
                tokio::select! {
                    _ = halt_rx.recv() => break 'reconnect,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_CEILING);
                continue 'reconnect;
            }
        };

        let hs = tokio::select! {
            _ = halt_rx.recv() => break 'reconnect,
            result = handshake(&conn, &identity, link_public) => result,
        };
        let (mut send_stream, creds) = match hs {
            Ok(ok) => ok,
            Err(e) => {
                debug!(%peer, "handshake failed: {e}");
                tokio::select! {
                    _ = halt_rx.recv() => break 'reconnect,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(BACKOFF_CEILING);
                continue 'reconnect;
            }
        };

        // The peer must prove it is the node we dialed, and the PKI must
        // still consider it a valid outgoing destination.
        let (_desc, _can_send, is_valid) = pki.authenticate_outgoing(&creds);
        if creds.node_id() != Some(peer_id) || !is_valid {
            debug!(%peer, "outgoing authentication rejected peer");
            tokio::select! {
                _ = halt_rx.recv() => break 'reconnect,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_CEILING);
            continue 'reconnect;
        }

        state = SessionState::Authenticated;
        debug!(%peer, ?state, "session state");
        backoff = BACKOFF_FLOOR;

        state = SessionState::Sending;
        debug!(%peer, ?state, "session state");
        loop {
            tokio::select! {
                _ = halt_rx.recv() => break 'reconnect,
                packet = rx.recv() => {
                    match packet {
                        Some(packet) => {
                            if let Err(e) = wire::send_packet(&mut send_stream, &packet).await {
                                debug!(%peer, "send failed, reconnecting: {e}");
                                continue 'reconnect;
                            }
                        }
                        None => break 'reconnect,
                    }
                }
            }
        }
    }

    state = SessionState::Closing;
    debug!(%peer, ?state, "session state");
    rx.close();
}

/// Dial-side handshake: open the packet stream, send our hello, and
/// verify the peer's.
async fn handshake(
    conn: &quinn::Connection,
    identity: &SigningKey,
    link_public: [u8; 32],
) -> std::result::Result<(quinn::SendStream, PeerCredentials), veil_transport::TransportError> {
    let (mut send_stream, mut recv_stream) = LinkNode::open_bi(conn).await?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let hello = Hello::new(identity, link_public, timestamp);
    wire::send_hello(&mut send_stream, &hello).await?;

    let creds = wire::recv_hello(&mut recv_stream).await?;
    Ok((send_stream, creds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_crypto::ed25519::IdentityKey;
    use veil_types::epoch::EpochTime;
    use veil_types::pki::{Document, Layer, MixDescriptor};

    fn descriptor(name: &str, id_byte: u8, layer: Layer) -> MixDescriptor {
        MixDescriptor {
            name: name.to_string(),
            identity_key: [id_byte; 32],
            link_key: [id_byte ^ 0xff; 32],
            layer,
            addresses: vec!["127.0.0.1:1".to_string()],
        }
    }

    fn current_epoch_doc(exit_bytes: &[u8]) -> Document {
        Document {
            epoch: EpochTime::now().epoch,
            topology: vec![
                vec![descriptor("entry", 0x10, Layer::Mix(0))],
                vec![descriptor("middle", 0x20, Layer::Mix(1))],
                exit_bytes
                    .iter()
                    .map(|&b| descriptor(&format!("exit{b}"), b, Layer::Mix(2)))
                    .collect(),
            ],
            providers: vec![descriptor("provider", 0x40, Layer::Provider)],
        }
    }

    fn test_pki(exit_bytes: &[u8]) -> Arc<Pki> {
        let pki = Arc::new(Pki::new(
            [0x20; 32],
            "middle".to_string(),
            false,
            false,
            None,
        ));
        let entry = crate::pki::PkiCacheEntry::new(
            current_epoch_doc(exit_bytes),
            &[0x20; 32],
            "middle",
            false,
        )
        .expect("entry");
        pki.insert(entry);
        pki
    }

    fn test_connector(pki: Arc<Pki>) -> Arc<Connector> {
        let identity = IdentityKey::generate();
        Connector::new(
            pki,
            Arc::new(identity.signing_key),
            [0u8; 32],
            Arc::new(Counters::default()),
        )
        .expect("connector")
    }

    #[tokio::test]
    async fn test_force_update_spawns_and_halts_sessions() {
        let pki = test_pki(&[0x30, 0x31]);
        let connector = test_connector(Arc::clone(&pki));

        connector.force_update();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut peers = connector.session_peers();
        peers.sort();
        assert_eq!(peers, vec![[0x30; 32], [0x31; 32]]);

        // A new document delists 0x31; its session must go away.
        let entry = crate::pki::PkiCacheEntry::new(
            current_epoch_doc(&[0x30]),
            &[0x20; 32],
            "middle",
            false,
        )
        .expect("entry");
        pki.insert(entry);
        connector.force_update();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(connector.session_peers(), vec![[0x30; 32]]);
        connector.halt().await;
    }

    #[tokio::test]
    async fn test_send_without_session_drops() {
        let pki = test_pki(&[0x30]);
        let counters = Arc::new(Counters::default());
        let identity = IdentityKey::generate();
        let connector = Connector::new(
            pki,
            Arc::new(identity.signing_key),
            [0u8; 32],
            Arc::clone(&counters),
        )
        .expect("connector");

        connector.send([0x55; 32], vec![0u8; 8]);
        assert_eq!(
            counters
                .no_session_drops
                .load(std::sync::atomic::Ordering::Relaxed),
            1,
        );
        connector.halt().await;
    }
}
